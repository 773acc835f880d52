//! Ingest of asynchronous container events from the external observer
//!
//! The observer watches the container backend and reports events over an
//! authenticated channel. Only container die events carrying this
//! deployment's prefix are of interest; everything else is dropped.

use crate::error::{Result, SchedulerError};
use crate::SchedulerHandle;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;
use zoe_shared::ZoeConfig;

const ATTRIBUTE_PREFIX: &str = "zoe.prefix";
const ATTRIBUTE_CONTAINER_ID: &str = "zoe.container.id";

/// A container event as delivered by the observer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendEvent {
    #[serde(rename = "Type", alias = "type", default)]
    pub kind: String,

    #[serde(rename = "Action", alias = "action", default)]
    pub action: String,

    #[serde(rename = "Actor", alias = "actor", default)]
    pub actor: EventActor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "Attributes", alias = "attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl BackendEvent {
    /// Shorthand for building a die event, used by tests and tooling.
    pub fn die(prefix: &str, container_id: i64) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(ATTRIBUTE_PREFIX.to_string(), prefix.to_string());
        attributes.insert(ATTRIBUTE_CONTAINER_ID.to_string(), container_id.to_string());
        Self {
            kind: "container".to_string(),
            action: "die".to_string(),
            actor: EventActor { attributes },
        }
    }
}

/// Accepts observer events and forwards relevant ones to the scheduler
pub struct EventIngest {
    container_name_prefix: String,
    shared_secret: String,
    scheduler: SchedulerHandle,
}

impl EventIngest {
    pub fn new(config: &ZoeConfig, scheduler: SchedulerHandle) -> Self {
        Self {
            container_name_prefix: config.container_name_prefix.clone(),
            shared_secret: config.observer_shared_secret.clone(),
            scheduler,
        }
    }

    /// Filter one event and forward it to the scheduler when relevant.
    ///
    /// Returns whether the event was forwarded. Events of the wrong type,
    /// with a foreign prefix, an uninteresting action or an unparseable
    /// container id are dropped without error.
    pub fn deliver(&self, secret: &str, event: &BackendEvent) -> Result<bool> {
        if secret != self.shared_secret {
            return Err(SchedulerError::EventAuth);
        }

        if event.kind != "container" {
            return Ok(false);
        }
        match event.actor.attributes.get(ATTRIBUTE_PREFIX) {
            Some(prefix) if *prefix == self.container_name_prefix => {}
            _ => return Ok(false),
        }
        if event.action != "die" {
            return Ok(false);
        }
        let container_id = match event
            .actor
            .attributes
            .get(ATTRIBUTE_CONTAINER_ID)
            .and_then(|raw| raw.parse::<i64>().ok())
        {
            Some(id) => id,
            None => {
                debug!("die event without a parseable container id");
                return Ok(false);
            }
        };

        debug!(container_id, "forwarding container die event");
        self.scheduler.container_died(container_id)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchedulerHandle;

    fn ingest() -> (EventIngest, tokio::sync::mpsc::UnboundedReceiver<crate::Command>) {
        let (handle, commands) = SchedulerHandle::detached();
        let mut config = ZoeConfig::default();
        config.container_name_prefix = "zoe".to_string();
        config.observer_shared_secret = "s3cret".to_string();
        (EventIngest::new(&config, handle), commands)
    }

    #[tokio::test]
    async fn die_event_is_forwarded() {
        let (ingest, mut commands) = ingest();
        let forwarded = ingest
            .deliver("s3cret", &BackendEvent::die("zoe", 42))
            .unwrap();
        assert!(forwarded);
        assert!(matches!(
            commands.recv().await,
            Some(crate::Command::ContainerDied { service_id: 42 })
        ));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (ingest, _commands) = ingest();
        assert!(matches!(
            ingest
                .deliver("nope", &BackendEvent::die("zoe", 42))
                .unwrap_err(),
            SchedulerError::EventAuth
        ));
    }

    #[tokio::test]
    async fn non_container_events_are_dropped() {
        let (ingest, _commands) = ingest();
        let mut event = BackendEvent::die("zoe", 42);
        event.kind = "network".to_string();
        assert!(!ingest.deliver("s3cret", &event).unwrap());
    }

    #[tokio::test]
    async fn foreign_prefix_is_dropped() {
        let (ingest, _commands) = ingest();
        let event = BackendEvent::die("other-deployment", 42);
        assert!(!ingest.deliver("s3cret", &event).unwrap());
    }

    #[tokio::test]
    async fn non_die_actions_are_dropped() {
        let (ingest, _commands) = ingest();
        let mut event = BackendEvent::die("zoe", 42);
        event.action = "start".to_string();
        assert!(!ingest.deliver("s3cret", &event).unwrap());
    }

    #[tokio::test]
    async fn unparseable_container_id_is_dropped() {
        let (ingest, _commands) = ingest();
        let mut event = BackendEvent::die("zoe", 42);
        event
            .actor
            .attributes
            .insert(ATTRIBUTE_CONTAINER_ID.to_string(), "abc".to_string());
        assert!(!ingest.deliver("s3cret", &event).unwrap());
    }

    #[test]
    fn docker_shaped_json_deserializes() {
        let raw = r#"{
            "Type": "container",
            "Action": "die",
            "Actor": {"Attributes": {"zoe.prefix": "zoe", "zoe.container.id": "7"}}
        }"#;
        let event: BackendEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind, "container");
        assert_eq!(
            event.actor.attributes.get("zoe.container.id").unwrap(),
            "7"
        );
    }
}
