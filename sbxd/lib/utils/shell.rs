//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Quotes a single argument for POSIX shell interpolation.
///
/// Bare-safe words pass through unchanged; anything else is wrapped in single
/// quotes with embedded `'` escaped as `'"'"'`. The empty argument becomes
/// `''`.
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let needs_quoting = arg
        .chars()
        .any(|c| matches!(c, '\'' | '"' | '\\' | '$' | '`' | ' ' | '\t' | '\n'));
    if !needs_quoting {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}

/// Joins an argv into a single shell-safe command string.
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
