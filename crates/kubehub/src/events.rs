use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kestrel_status::{EventKind, EventRecorder};
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};

/// Publishes events through the `events.k8s.io` API.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        let reporter = Reporter { controller: controller.into(), instance: std::env::var("POD_NAME").ok() };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        object: &ObjectReference,
        kind: EventKind,
        reason: &str,
        action: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let type_ = match kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        recorder
            .publish(Event {
                type_,
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: action.to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}
