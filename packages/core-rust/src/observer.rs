//! Message observer contract: the entry point transports dispatch into, and
//! the sink a chain hands faulted messages to.

use crate::message::Message;

/// Receives a message for processing.
pub trait MessageObserver: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if processing failed in a way the caller must see.
    /// Fault observers returning an error signal a double fault.
    fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

impl<F> MessageObserver for F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn closures_are_observers() {
        let observer: Arc<dyn MessageObserver> = Arc::new(|message: &Message| -> anyhow::Result<()> {
            message.insert("seen", true);
            Ok(())
        });
        let message = Message::new();
        observer.on_message(&message).unwrap();
        assert_eq!(message.get::<bool>("seen").as_deref(), Some(&true));
    }
}
