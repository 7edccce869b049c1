use anyhow::{anyhow, Result};

/// Quotes `value` for a POSIX shell so it always reaches the remote command as one word.
pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Expands `{name}` placeholders in a command template with shell-quoted values.
///
/// `{{` and `}}` produce literal braces. Unknown placeholders are an error rather
/// than being passed through to the remote shell.
pub fn render(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(anyhow!("unterminated placeholder in command template")),
                    }
                }
                let value = vars
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| anyhow!("unknown placeholder {{{name}}} in command template"))?;
                out.push_str(&shell_quote(value));
            }
            '}' => return Err(anyhow!("unmatched '}}' in command template")),
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Placeholders a template must reference; used when validating configuration.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '{' => {
                let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            _ => {}
        }
    }
    names
}

/// Image names, tags and container ids are interpolated into docker commands; keep them to
/// the character set docker itself accepts.
pub fn validate_docker_ref(label: &str, value: &str) -> Result<(), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{label} is required"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@'))
    {
        return Err(format!("{label} contains unsupported characters"));
    }
    Ok(())
}
