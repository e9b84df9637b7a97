//! `sessiond doctor`: checks data directory writability and port
//! availability and reports without starting the server (§12, grounded in
//! the teacher's `cli::doctor::run` check-and-report shape).

use sd_domain::config::Config;

/// Run all diagnostic checks and print a summary. Returns `true` when
/// every check passes.
pub async fn run(config: &Config, config_path: &std::path::Path) -> bool {
    println!("sessiond doctor");
    println!("===============\n");

    let mut all_passed = true;
    check_config_file(config_path, &mut all_passed);
    check_data_dir_writable(config, &mut all_passed);
    check_port_available(config, &mut all_passed).await;

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }
    all_passed
}

fn check_config_file(config_path: &std::path::Path, all_passed: &mut bool) {
    let exists = config_path.exists();
    print_check(
        "Config file exists",
        true,
        if exists {
            config_path.display().to_string()
        } else {
            format!("{} not found (using defaults)", config_path.display())
        },
    );
    let _ = all_passed;
}

fn check_data_dir_writable(config: &Config, all_passed: &mut bool) {
    let dir = &config.daemon.data_dir;
    let probe = dir.join(".doctor-probe");
    let writable = std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(&probe, b"ok"))
        .and_then(|_| std::fs::remove_file(&probe))
        .is_ok();
    print_check("Data directory writable", writable, dir.display().to_string());
    if !writable {
        *all_passed = false;
    }
}

async fn check_port_available(config: &Config, all_passed: &mut bool) {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let available = tokio::net::TcpListener::bind(&addr).await.is_ok();
    print_check(
        "Preferred bind port available",
        available,
        if available {
            addr
        } else {
            format!("{addr} in use (daemon will try {} fallback port(s))", config.server.port_fallback_count)
        },
    );
    // Not fatal: §4.7 tries a small range of fallback ports.
    let _ = all_passed;
}

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}
