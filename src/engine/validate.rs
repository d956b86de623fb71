//! Validation functions for configuration values.

use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

pub fn validate_file_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    if name.as_ref().is_empty() || !is_sanitized(name.as_ref()) {
        return Err(ValidationError::new("InvalidFileName").with_message(
            format!(
                "Invalid file name {:?}, try sanitizing like {:?}",
                name.as_ref(),
                sanitize(name.as_ref())
            )
            .into(),
        ));
    }

    Ok(())
}

pub fn validate_absolute<P: AsRef<Path>>(path: P) -> Result<(), ValidationError> {
    let path = path.as_ref();
    if !path.is_absolute() {
        return Err(ValidationError::new("InvalidPath")
            .with_message(format!("{:?} must be an absolute path", path).into()));
    }

    Ok(())
}

pub fn validate_relative<P: AsRef<Path>>(path: P) -> Result<(), ValidationError> {
    let path = path.as_ref();
    if path.is_absolute() || path.as_os_str().is_empty() {
        return Err(ValidationError::new("InvalidPath").with_message(
            format!("{:?} must be a non-empty path relative to primary storage", path).into(),
        ));
    }

    Ok(())
}

pub fn validate_program<S: AsRef<str>>(program: S) -> Result<(), ValidationError> {
    let program = program.as_ref();
    if program.trim().is_empty() || program.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("InvalidProgram").with_message(
            format!("{:?} must be a single program name or path", program).into(),
        ));
    }

    Ok(())
}
