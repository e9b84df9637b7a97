//! Shell-free command string tokenizer (§4.5).
//!
//! Splits a command string into argv the way a POSIX shell's word-splitting
//! would, honoring single quotes, double quotes, and backslash escapes, but
//! never invokes a shell. Shell metacharacters (`;`, `|`, backtick, `$()`)
//! are ordinary literal characters once inside or outside a quoted region —
//! there is no expansion step, which is what closes the shell-injection
//! class by construction rather than by blocklisting.

use sd_domain::error::{Error, Result};

pub fn tokenize(command: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars().peekable();

    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }
    let mut quote = Quote::None;

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.peek() {
                    Some(&next) if matches!(next, '"' | '\\' | '$' | '`') => {
                        current.push(next);
                        chars.next();
                    }
                    _ => current.push('\\'),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                ' ' | '\t' | '\n' => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                '\'' => {
                    quote = Quote::Single;
                    in_token = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_token = true;
                }
                '\\' => {
                    in_token = true;
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => {
                    in_token = true;
                    current.push(c);
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(Error::InvalidInput(
            "unterminated quote in command string".into(),
        ));
    }
    if in_token {
        tokens.push(current);
    }

    if tokens.is_empty() {
        return Err(Error::InvalidInput("empty command".into()));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(tokenize("echo hello world").unwrap(), vec!["echo", "hello", "world"]);
    }

    #[test]
    fn single_quotes_are_literal() {
        assert_eq!(
            tokenize("echo 'a b; rm -rf /'").unwrap(),
            vec!["echo", "a b; rm -rf /"]
        );
    }

    #[test]
    fn double_quotes_allow_escapes() {
        assert_eq!(
            tokenize(r#"echo "a \"quoted\" $HOME""#).unwrap(),
            vec!["echo", r#"a "quoted" $HOME"#]
        );
    }

    #[test]
    fn shell_metacharacters_are_literal_outside_quotes() {
        assert_eq!(
            tokenize("echo a;b|c`d`").unwrap(),
            vec!["echo", "a;b|c`d`"]
        );
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(tokenize("echo 'unterminated").is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(tokenize("   ").is_err());
    }

    #[test]
    fn backslash_escapes_a_space_outside_quotes() {
        assert_eq!(tokenize(r"echo foo\ bar").unwrap(), vec!["echo", "foo bar"]);
    }
}
