use crate::net_protocol::workers::WorkerId;
use anyhow::{anyhow, Error};

/// Opaque thread-safe error.
/// Only use this when the error is unrecoverable and intended to reach a sink,
/// like the tracing logs in a server.
pub type AnyError = Error;

#[derive(Debug)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

/// An error, and the place in dtq's source where it was caught.
#[derive(Debug)]
pub struct LocatedError {
    pub error: AnyError,
    pub location: &'static Location,
}

impl std::error::Error for LocatedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

impl std::fmt::Display for LocatedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            error,
            location: Location { file, line, column },
        } = self;
        write!(f, "{error} at {file}@{line}:{column}")
    }
}

pub type OpaqueResult<T> = Result<T, LocatedError>;

pub trait ResultLocation<T> {
    fn located(self, location: &'static Location) -> OpaqueResult<T>;
}

impl<T, E: Into<Box<dyn std::error::Error + Send + Sync>>> ResultLocation<T> for Result<T, E> {
    #[inline]
    fn located(self, location: &'static Location) -> OpaqueResult<T> {
        self.map_err(|error| error.located(location))
    }
}

pub trait ErrorLocation {
    fn located(self, location: &'static Location) -> LocatedError;
}

impl<E: Into<Box<dyn std::error::Error + Send + Sync>>> ErrorLocation for E {
    #[inline]
    fn located(self, location: &'static Location) -> LocatedError {
        let boxed: Box<dyn std::error::Error + Send + Sync> = self.into();
        let error: anyhow::Error = anyhow!(boxed);
        LocatedError { error, location }
    }
}

/// An error raised while serving one request, with the worker that sent the request, if
/// the request named one.
#[derive(Debug)]
pub struct RequestError {
    pub error: LocatedError,
    pub worker_id: Option<WorkerId>,
}

pub trait ErrorWorker<T> {
    fn no_worker(self) -> Result<T, RequestError>;
    fn for_worker(self, worker_id: &WorkerId) -> Result<T, RequestError>;
}

impl<T> ErrorWorker<T> for OpaqueResult<T> {
    #[inline]
    fn no_worker(self) -> Result<T, RequestError> {
        self.map_err(|error| RequestError {
            error,
            worker_id: None,
        })
    }

    #[inline]
    fn for_worker(self, worker_id: &WorkerId) -> Result<T, RequestError> {
        self.map_err(|error| RequestError {
            error,
            worker_id: Some(worker_id.clone()),
        })
    }
}

pub use crate::here;

#[macro_export]
macro_rules! here {
    () => {
        &$crate::error::Location {
            file: file!(),
            line: line!(),
            column: column!(),
        }
    };
}

pub use crate::log_request_error;

#[macro_export]
macro_rules! log_request_error {
    ($err:expr, $($field:tt)*) => {{
        let $crate::error::RequestError {
            error:
                $crate::error::LocatedError {
                    error,
                    location: $crate::error::Location { file, line, column },
                },
            worker_id,
        } = $err;
        match worker_id {
            Some(worker_id) => {
                tracing::error!(%worker_id, file, line, column, $($field)*, error)
            }
            None => {
                tracing::error!(worker_id = "<unknown>", file, line, column, $($field)*, error)
            }
        }
    }};
}

#[cfg(test)]
mod test {
    use super::{ErrorWorker, ResultLocation};
    use crate::net_protocol::workers::WorkerId;

    #[test]
    fn located_error_displays_source_location() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "connection reset",
        ));
        let located = result.located(crate::here!()).unwrap_err();

        let shown = located.to_string();
        assert!(shown.starts_with("connection reset at "), "{shown}");
        assert!(shown.contains("error.rs@"), "{shown}");
    }

    #[test]
    fn request_error_remembers_worker() {
        let result: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let worker_id = WorkerId::from("worker-1");
        let error = result
            .located(crate::here!())
            .for_worker(&worker_id)
            .unwrap_err();

        assert_eq!(error.worker_id, Some(worker_id));
    }
}
