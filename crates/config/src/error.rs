/// Errors raised while loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration file could not be opened or read.
    #[error("Failed to open configuration file: {0}")]
    ConfigOpen(#[from] std::io::Error),
    /// The configuration file's contents were not valid TOML for our schema.
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
