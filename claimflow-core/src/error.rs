use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Store Error - {0}")]
    Store(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Admission Error - {0}")]
    Admission(String),

    #[error("Invalid Message - {0}")]
    InvalidMessage(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Unsupported Operation - {0}")]
    Unsupported(String),

    #[error("Shutdown Error - {0}")]
    Shutdown(String),

    #[error("Multiple Errors - [{}]", join_errors(.0))]
    Multiple(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Attaches `next` to this error. Nested [Error::Multiple] values are flattened so the chain
    /// stays a single list in the order the errors were observed.
    pub fn chain(self, next: Error) -> Error {
        let mut errors = self.into_vec();
        errors.extend(next.into_vec());
        Error::Multiple(errors)
    }

    /// Turns a list of collected errors into a result. No errors is `Ok`, a single error is
    /// returned as is.
    pub fn from_many(errors: Vec<Error>) -> Result<()> {
        let mut errors = errors.into_iter().flat_map(Error::into_vec).collect::<Vec<_>>();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    fn into_vec(self) -> Vec<Error> {
        match self {
            Error::Multiple(errors) => errors,
            other => vec![other],
        }
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_flattens() {
        let first = Error::Store("write failed".to_string());
        let second = Error::Store("second write failed".to_string())
            .chain(Error::Checkpoint("persist failed".to_string()));

        let chained = first.chain(second);
        let Error::Multiple(errors) = chained else {
            panic!("expected chained errors");
        };
        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[0], Error::Store(ref msg) if msg == "write failed"));
        assert!(matches!(errors[2], Error::Checkpoint(_)));
    }

    #[test]
    fn test_from_many() {
        assert!(Error::from_many(vec![]).is_ok());

        let single = Error::from_many(vec![Error::Config("bad".to_string())]).unwrap_err();
        assert!(matches!(single, Error::Config(_)));

        let many = Error::from_many(vec![
            Error::Store("a".to_string()),
            Error::Shutdown("b".to_string()),
        ])
        .unwrap_err();
        assert_eq!(
            many.to_string(),
            "Multiple Errors - [Store Error - a; Shutdown Error - b]"
        );
    }
}
