//! Log sink: a handler that writes every delivered message to the log.

use dgbus_core::Message;
use dgbus_services::Handler;

pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(topic: &str) -> Self {
        Self {
            name: format!("log-sink:{topic}"),
        }
    }
}

impl Handler for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let properties = serde_json::to_string(&message.properties)?;
        tracing::info!(
            topic = %message.topic,
            bytes = message.payload.len(),
            properties = %properties,
            "message received"
        );
        Ok(())
    }
}
