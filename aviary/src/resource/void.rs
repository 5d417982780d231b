//! A fire-and-forget resource that swallows whatever is executed against
//! it. Handy as a drop-in replacement for a real destination that has been
//! taken out of service: callers keep their transactional code unchanged
//! while the cage discards the traffic.

use faststr::FastStr;
use futures::future::BoxFuture;

use crate::{
    error::Result,
    resource::{Call, Resource},
    value::Value,
};

pub struct VoidResource {
    pool: FastStr,
}

impl VoidResource {
    pub fn new(pool: FastStr) -> Self {
        VoidResource { pool }
    }
}

impl Resource for VoidResource {
    fn execute<'a>(&'a mut self, call: &'a Call) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            tracing::debug!(
                "[AVIARY] resource {} discarded a call with {} argument(s)",
                self.pool,
                call.args.len()
            );
            Ok(Value::Null)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discards_and_succeeds() {
        let mut resource = VoidResource::new("void_1".into());
        let call = Call::execute(vec![Value::Int(1)], Default::default());
        assert_eq!(resource.execute(&call).await.unwrap(), Value::Null);
        // inherited no-op transactional capabilities
        resource.commit().await.unwrap();
        resource.rollback().await.unwrap();
    }
}
