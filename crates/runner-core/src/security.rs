//! Argv element security checks applied before any subprocess is spawned.
//!
//! Grounded in `task_runner.executers.security.check_command_elem_security`:
//! every element of a command's argv (and any MPI prompt strings) must be
//! non-empty and within a bounded length. Simulator-specific command
//! builders may layer additional, stricter checks (e.g. a first-token
//! allow-list) on top of this generic one.

use anyhow::{Result, bail};

/// Upper bound on a single argv element's length, in bytes.
pub const MAX_ELEMENT_LEN: usize = 256;

/// Check one command element for the generic rules: must be non-empty and
/// no longer than [`MAX_ELEMENT_LEN`].
pub fn check_command_elem_security(elem: &str) -> Result<()> {
    if elem.is_empty() {
        bail!("command element must not be empty");
    }
    if elem.len() > MAX_ELEMENT_LEN {
        bail!(
            "command element exceeds maximum length of {MAX_ELEMENT_LEN} characters: {elem:.40}..."
        );
    }
    Ok(())
}

/// Check every element of an argv list.
pub fn check_argv_security(argv: &[String]) -> Result<()> {
    for elem in argv {
        check_command_elem_security(elem)?;
    }
    Ok(())
}

/// A first-token allow-list layered on top of the generic check: the first
/// argv element (the executable name) must appear in `allowed`.
pub fn check_first_token_allowed(argv: &[String], allowed: &[&str]) -> Result<()> {
    let first = argv.first().map(String::as_str).unwrap_or("");
    if !allowed.contains(&first) {
        bail!("command '{first}' is not in the allowed list for this simulator");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_element() {
        assert!(check_command_elem_security("").is_err());
    }

    #[test]
    fn rejects_overlong_element() {
        let long = "a".repeat(MAX_ELEMENT_LEN + 1);
        assert!(check_command_elem_security(&long).is_err());
    }

    #[test]
    fn accepts_element_at_exact_limit() {
        let exact = "a".repeat(MAX_ELEMENT_LEN);
        assert!(check_command_elem_security(&exact).is_ok());
    }

    #[test]
    fn accepts_normal_argv() {
        let argv = vec!["echo".to_string(), "hello".to_string()];
        assert!(check_argv_security(&argv).is_ok());
    }

    #[test]
    fn first_token_allow_list_rejects_unlisted_binary() {
        let argv = vec!["rm".to_string(), "-rf".to_string()];
        assert!(check_first_token_allowed(&argv, &["openfoam", "simple_foam"]).is_err());
    }

    #[test]
    fn first_token_allow_list_accepts_listed_binary() {
        let argv = vec!["openfoam".to_string()];
        assert!(check_first_token_allowed(&argv, &["openfoam", "simple_foam"]).is_ok());
    }
}
