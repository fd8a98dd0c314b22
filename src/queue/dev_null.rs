//! A queue that accepts and forgets everything.

use async_trait::async_trait;

use crate::error_handling::Error;

use super::{check_limit, Capabilities, Popped, QueueOverflow, QueueToken};

/// Drops pushes and pops nothing. Useful when overflow should be discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevNullQueue;

impl DevNullQueue {
    pub fn new() -> Self {
        DevNullQueue
    }
}

#[async_trait]
impl QueueOverflow for DevNullQueue {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            count: true,
            durable: false,
            ordered: true,
        }
    }

    async fn length(&self) -> Result<Option<u64>, Error> {
        Ok(Some(0))
    }

    async fn is_empty(&self) -> Result<bool, Error> {
        Ok(true)
    }

    async fn clear(&self) -> Result<bool, Error> {
        Ok(true)
    }

    async fn push(&self, envelope: Option<&str>) -> Result<Option<QueueToken>, Error> {
        if envelope.is_some() {
            log::trace!("dev-null queue dropped an entry");
        }
        Ok(None)
    }

    async fn pop(&self, n: usize) -> Result<Popped, Error> {
        check_limit(n)?;
        Ok(Popped::Many(Vec::new()))
    }
}
