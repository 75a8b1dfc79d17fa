use std::future::Future;

use crate::ExchangeId;

pub(crate) fn instrumented_with_exchange_name<F>(
    name: String,
    id: ExchangeId,
    task: F,
) -> tracing::instrument::Instrumented<F> {
    use tracing::Instrument;

    task.instrument(tracing::info_span!("exchange", name = name, id = %id))
}

pub(crate) async fn instrument_with_exchange_name<R>(
    name: Option<String>,
    id: ExchangeId,
    task: impl Future<Output = R>,
) -> R {
    if let Some(name) = name {
        instrumented_with_exchange_name(name, id, task).await
    } else {
        task.await
    }
}
