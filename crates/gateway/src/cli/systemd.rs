//! Generate a systemd unit file for the daemon (§4.9 "only the unit-file
//! generation contract matters here"). Grounded in the teacher's
//! `cli::systemd::generate`, adapted to the `sessiond serve` entry point
//! and the daemon's own config/data-dir environment variables.

pub fn generate(user: &str, working_dir: Option<&str>, config_path: &str) -> String {
    let exe_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "/usr/local/bin/sessiond".to_string());

    let resolved_working_dir = working_dir.map(String::from).unwrap_or_else(|| {
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "/opt/sessiond".to_string())
    });

    format!(
        "\
[Unit]
Description=Local agent session daemon
After=network.target

[Service]
Type=simple
User={user}
WorkingDirectory={working_dir}
ExecStart={exe_path} serve
Environment=SD_CONFIG={config_path}
Restart=on-failure
RestartSec=5

# Logging
StandardOutput=journal
StandardError=journal
SyslogIdentifier=sessiond

# Security hardening
NoNewPrivileges=true
ProtectSystem=strict
ProtectHome=read-only
ReadWritePaths={working_dir}/data
PrivateTmp=true

[Install]
WantedBy=default.target",
        user = user,
        working_dir = resolved_working_dir,
        exe_path = exe_path,
        config_path = config_path,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_contains_expected_sections() {
        let unit = generate("sd-test", Some("/opt/sessiond"), "sd.toml");
        assert!(unit.contains("[Unit]"));
        assert!(unit.contains("[Service]"));
        assert!(unit.contains("[Install]"));
        assert!(unit.contains("User=sd-test"));
        assert!(unit.contains("WorkingDirectory=/opt/sessiond"));
        assert!(unit.contains("Environment=SD_CONFIG=sd.toml"));
        assert!(unit.contains("ReadWritePaths=/opt/sessiond/data"));
        assert!(unit.contains("ExecStart="));
        assert!(unit.contains("serve"));
    }
}
