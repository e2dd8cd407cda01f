#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown {entity}: {value}")]
    Unknown { entity: &'static str, value: String },
}
