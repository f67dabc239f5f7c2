/// Errors raised while validating values at the ingress boundary.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("latitude out of range: {0}")]
    LatitudeOutOfRange(f64),
    #[error("longitude out of range: {0}")]
    LongitudeOutOfRange(f64),
    #[error("coordinate requires both lat and lng")]
    PartialCoordinate,
}

/// Reasons an inbound frame is rejected by the decoder.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// Not JSON, not an object, or a known kind with the wrong shape.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Well-formed object whose `type` the server does not handle.
    #[error("unknown frame kind: {0}")]
    UnknownKind(String),
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(#[from] CoreError),
}

impl DecodeError {
    /// Short classification string for logging/metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownKind(_) => "unknown_kind",
            Self::InvalidCoordinate(_) => "invalid_coordinate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings() {
        assert_eq!(DecodeError::Malformed("x".into()).reason(), "malformed");
        assert_eq!(DecodeError::UnknownKind("x".into()).reason(), "unknown_kind");
        assert_eq!(
            DecodeError::from(CoreError::LatitudeOutOfRange(91.0)).reason(),
            "invalid_coordinate"
        );
    }

    #[test]
    fn display_includes_value() {
        let err = CoreError::LongitudeOutOfRange(200.5);
        assert!(err.to_string().contains("200.5"));
    }
}
