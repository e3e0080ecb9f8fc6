use core::error::Error;

/// Admin HTTP server errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Failed to bind admin server to {addr}")]
    Bind { addr: String },
    #[display("Invalid authentication material: {reason}")]
    AuthMaterial { reason: String },
}

impl Error for ApiError {}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn api_error_display_formatting() {
        let bind = ApiError::Bind {
            addr: "0.0.0.0:10250".to_string(),
        };
        assert_eq!(bind.to_string(), "Failed to bind admin server to 0.0.0.0:10250");

        let auth = ApiError::AuthMaterial {
            reason: "token file is empty".to_string(),
        };
        assert_eq!(
            auth.to_string(),
            "Invalid authentication material: token file is empty"
        );
    }
}
