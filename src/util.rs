use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

/// Runs `callback` inside a sentry transaction named after the job type.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: impl FnOnce() -> F,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
{
    let hub = Arc::new(Hub::new_from_top(Hub::current()));

    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "queue.task");
    let tx = hub.start_transaction(tx_ctx);

    hub.configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = callback().bind_hub(hub).await;

    tx.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    result
}

/// Turns the payload of a caught panic into an error that can be logged and
/// stored as the job's last error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn panic_messages_are_preserved() {
        let payload = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "job panicked: boom"
        );

        let id = 7;
        let payload = catch_unwind(|| panic!("payment {id} exploded")).unwrap_err();
        assert_eq!(
            try_to_extract_panic_info(&*payload).to_string(),
            "job panicked: payment 7 exploded"
        );
    }

    #[tokio::test]
    async fn sentry_transaction_passes_through_result() {
        let ok: Result<u8, &str> = with_sentry_transaction("test", || async { Ok(3) }).await;
        assert_eq!(ok, Ok(3));

        let err: Result<u8, &str> = with_sentry_transaction("test", || async { Err("nope") }).await;
        assert_eq!(err, Err("nope"));
    }
}
