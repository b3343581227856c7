use crate::{
    ntp::NtpClientError,
    ota::{OtaError, store::StoreError},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("NTP error: {0}")]
    NtpClient(#[from] NtpClientError),
    #[error("Upgrade error: {0}")]
    Ota(#[from] OtaError),
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),
    #[error("Other error: {0}")]
    Other(&'static str),
}

impl Error {
    pub fn other(err: &'static str) -> Self {
        Self::Other(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::http::HttpError;

    fn busy() -> core::result::Result<(), OtaError> {
        Err(OtaError::Busy)
    }

    fn check() -> Result<()> {
        busy()?;
        Ok(())
    }

    #[test]
    fn component_errors_convert() {
        assert!(matches!(check(), Err(Error::Ota(OtaError::Busy))));
        assert!(matches!(
            Error::from(NtpClientError::ShortResponse(12)),
            Error::NtpClient(NtpClientError::ShortResponse(12))
        ));
        // Protocol failures reach the crate error through the upgrade error.
        let err = Error::from(OtaError::from(HttpError::Status(404)));
        assert!(matches!(err, Error::Ota(OtaError::Protocol(HttpError::Status(404)))));
    }
}
