//! Configuration and startup errors

use thiserror::Error;

/// Error raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL in {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Wrap a URL parse failure with the name of the offending config field.
    pub fn invalid_url(field: &'static str, source: url::ParseError) -> Self {
        Self::InvalidUrl { field, source }
    }
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let config_err = Error::Config("protected path must start with '/'".into());
        assert_eq!(
            config_err.to_string(),
            "Configuration error: protected path must start with '/'"
        );

        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        assert!(
            io_err.to_string().starts_with("I/O error:"),
            "got: {}",
            io_err
        );
    }

    #[test]
    fn invalid_url_names_the_field() {
        let source = url::Url::parse("not a url").unwrap_err();
        let err = Error::invalid_url("site.origin", source);
        let msg = err.to_string();
        assert!(msg.contains("site.origin"), "got: {msg}");
    }
}
