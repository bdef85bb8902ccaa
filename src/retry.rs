/// Retries a fallible async store call a fixed number of times before
/// surfacing the last error. `$operation` is re-evaluated on every attempt.
macro_rules! retry_db_operation {
    ($context:expr, $operation:expr) => {{
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY_MS: u64 = 200;

        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= MAX_ATTEMPTS => {
                    log::error!(
                        "{} failed after {} attempts: {}",
                        context_value,
                        MAX_ATTEMPTS,
                        err
                    );
                    break Err(err);
                }
                Err(err) => {
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        MAX_ATTEMPTS,
                        context_value,
                        err,
                        RETRY_DELAY_MS
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_db_operation;
