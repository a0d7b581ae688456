use async_trait::async_trait;

use crate::task::Task;

/// Invokes the external side-effect for one task (spec §4.2).
///
/// Must be safe to call concurrently; the scheduler makes no assumption of
/// idempotence and will happily call `handle` again after a failure.
#[async_trait]
pub trait DispatchHandler: Send + Sync + 'static {
    async fn handle(&self, task: &Task) -> Result<(), String>;
}

/// `GET {sink_address}/{method}?k1=v1&k2=v2…`, success = status <= 201
/// (spec §6 "Dispatch wire format"). Grounded on the teacher's `reqwest`
/// based provider clients, generalized from a single hardcoded path to the
/// task's method.
pub struct HttpDispatchHandler {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDispatchHandler {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DispatchHandler for HttpDispatchHandler {
    async fn handle(&self, task: &Task) -> Result<(), String> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), task.method);
        let response = self
            .client
            .get(&url)
            .query(&task.params)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().as_u16() <= 201 {
            Ok(())
        } else {
            Err(format!("unexpected status code: {}", response.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Params;
    use chrono::Utc;

    struct AlwaysFail;

    #[async_trait]
    impl DispatchHandler for AlwaysFail {
        async fn handle(&self, _task: &Task) -> Result<(), String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn handler_trait_object_works() {
        let handler = AlwaysFail;
        let task = Task {
            id: 1,
            method: "notify".to_string(),
            params: Params::new(),
            at: Utc::now(),
            completed: false,
            retries: 0,
        };
        assert!(handler.handle(&task).await.is_err());
    }
}
