//! Desktop Exec line handling
//!
//! Expands a freedesktop `Exec=` template into an argv vector, applying
//! the `%` field codes against a pre-escaped URI list, and optionally
//! front-loads the apparmor wrapper.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("Invalid quoting in exec line: {0}")]
    Malformed(String),

    #[error("Exec line expanded to no tokens: {0}")]
    Empty(String),
}

/// Profile value that means "no confinement"
pub const UNCONFINED: &str = "unconfined";

/// Expand an Exec template against a URI list
///
/// Both inputs use shell quoting rules: quotes group tokens and a
/// backslash escapes one character. The URIs arrive already escaped, so
/// their tokens are substituted verbatim.
pub fn parse_exec(template: &str, uris: &str) -> Result<Vec<String>, ExecError> {
    let tokens =
        shlex::split(template).ok_or_else(|| ExecError::Malformed(template.to_string()))?;
    let uri_list = if uris.is_empty() {
        Vec::new()
    } else {
        shlex::split(uris).ok_or_else(|| ExecError::Malformed(uris.to_string()))?
    };

    let mut argv = Vec::new();
    for token in &tokens {
        expand_token(token, &uri_list, &mut argv);
    }

    if argv.is_empty() {
        return Err(ExecError::Empty(template.to_string()));
    }
    Ok(argv)
}

/// Expand the field codes of one token into the argv
fn expand_token(token: &str, uris: &[String], argv: &mut Vec<String>) {
    // A standalone list code fans out to one argv entry per URI.
    match token {
        "%U" => {
            argv.extend(uris.iter().cloned());
            return;
        }
        "%u" => {
            argv.extend(uris.first().cloned());
            return;
        }
        _ => {}
    }

    let mut out = String::new();
    let mut had_code = false;
    let mut chars = token.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            // Trailing bare percent, keep it
            None => out.push('%'),
            Some('%') => out.push('%'),
            Some('u') => {
                had_code = true;
                if let Some(first) = uris.first() {
                    out.push_str(first);
                }
            }
            Some('U') => {
                had_code = true;
                out.push_str(&uris.join(" "));
            }
            // File-path translation is deferred, the codes expand to
            // nothing until someone needs it
            Some('f') | Some('F') => had_code = true,
            // Icon, translated name and desktop-file path are not
            // available at this layer
            Some('i') | Some('c') | Some('k') => had_code = true,
            // Deprecated codes expand to nothing
            Some('d') | Some('D') | Some('n') | Some('N') | Some('v') | Some('m') => {
                had_code = true
            }
            Some(other) => {
                had_code = true;
                log::warn!("Desktop Exec line code '%{}' unknown, skipping", other);
            }
        }
    }

    // A token whose codes all expanded to nothing is dropped entirely
    if out.is_empty() && had_code {
        return;
    }
    argv.push(out);
}

/// Prepend the apparmor front-loader when a real profile is set
pub fn wrap_apparmor(argv: Vec<String>, profile: Option<&str>) -> Vec<String> {
    match profile {
        Some(profile) if !profile.is_empty() && profile != UNCONFINED => {
            let mut wrapped = Vec::with_capacity(argv.len() + 3);
            wrapped.push("aa-exec".to_string());
            wrapped.push("-p".to_string());
            wrapped.push(profile.to_string());
            wrapped.extend(argv);
            wrapped
        }
        _ => argv,
    }
}
