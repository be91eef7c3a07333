// ABOUTME: Registry of local event processors known to the control channel.
// ABOUTME: Maps each processor name to its status supplier and instruction handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::handlers::{EventProcessorInfoSupplier, EventProcessorInstructionHandler};
use crate::ids::{EventProcessorName, RegistrationId};

#[derive(Clone)]
struct RegisteredProcessor {
    registration: RegistrationId,
    supplier: Arc<dyn EventProcessorInfoSupplier>,
    handler: Arc<dyn EventProcessorInstructionHandler>,
}

/// Event processors of one client, owned by the control channel actor.
///
/// A name holds one processor at a time. Registering a name again replaces the
/// previous processor, and a stale registration cannot remove its successor.
#[derive(Clone, Default)]
pub struct EventProcessorCollection {
    processors: HashMap<EventProcessorName, RegisteredProcessor>,
}

impl fmt::Debug for EventProcessorCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.processors.keys().map(EventProcessorName::as_str).collect();
        names.sort_unstable();
        f.debug_struct("EventProcessorCollection")
            .field("processors", &names)
            .finish()
    }
}

impl EventProcessorCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registration this one replaced, if any.
    pub fn register(
        &mut self,
        name: EventProcessorName,
        registration: RegistrationId,
        supplier: Arc<dyn EventProcessorInfoSupplier>,
        handler: Arc<dyn EventProcessorInstructionHandler>,
    ) -> Option<RegistrationId> {
        self.processors
            .insert(
                name,
                RegisteredProcessor {
                    registration,
                    supplier,
                    handler,
                },
            )
            .map(|previous| previous.registration)
    }

    /// Removes the processor only while `registration` is still the current one.
    pub fn unregister(&mut self, name: &EventProcessorName, registration: &RegistrationId) -> bool {
        match self.processors.get(name) {
            Some(current) if &current.registration == registration => {
                self.processors.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn supplier(&self, name: &EventProcessorName) -> Option<Arc<dyn EventProcessorInfoSupplier>> {
        self.processors.get(name).map(|p| p.supplier.clone())
    }

    pub fn handler(&self, name: &EventProcessorName) -> Option<Arc<dyn EventProcessorInstructionHandler>> {
        self.processors.get(name).map(|p| p.handler.clone())
    }

    pub fn suppliers(&self) -> Vec<(EventProcessorName, Arc<dyn EventProcessorInfoSupplier>)> {
        self.processors
            .iter()
            .map(|(name, p)| (name.clone(), p.supplier.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdGenerator;
    use crate::testing::FakeEventProcessor;
    use axon_proto::control::EventProcessorInfo;

    fn name(value: &str) -> EventProcessorName {
        EventProcessorName::new(value).unwrap()
    }

    fn register(
        collection: &mut EventProcessorCollection,
        processor: &str,
        registration: &RegistrationId,
    ) -> (Arc<FakeEventProcessor>, Option<RegistrationId>) {
        let fake = FakeEventProcessor::new(processor);
        let replaced = collection.register(
            name(processor),
            registration.clone(),
            fake.clone(),
            fake.clone(),
        );
        (fake, replaced)
    }

    #[test]
    fn test_register_and_look_up() {
        let ids = IdGenerator::sequential("r");
        let mut collection = EventProcessorCollection::new();
        assert!(collection.is_empty());

        register(&mut collection, "projections", &ids.registration_id());
        register(&mut collection, "sagas", &ids.registration_id());

        assert_eq!(collection.len(), 2);
        assert!(collection.handler(&name("projections")).is_some());
        assert!(collection.supplier(&name("missing")).is_none());
        let mut names: Vec<String> = collection
            .suppliers()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["projections", "sagas"]);
    }

    #[tokio::test]
    async fn test_reregistering_replaces_the_processor() {
        let ids = IdGenerator::sequential("r");
        let first = ids.registration_id();
        let second = ids.registration_id();
        let mut collection = EventProcessorCollection::new();

        let (_, replaced) = register(&mut collection, "projections", &first);
        assert!(replaced.is_none());
        let (newer, replaced) = register(&mut collection, "projections", &second);
        assert_eq!(replaced, Some(first.clone()));
        newer.set_info(EventProcessorInfo {
            processor_name: "projections".to_string(),
            active_threads: 3,
            ..Default::default()
        });

        let supplier = collection.supplier(&name("projections")).unwrap();
        assert_eq!(supplier.info().await.unwrap().unwrap().active_threads, 3);
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_stale_registration_does_not_remove_successor() {
        let ids = IdGenerator::sequential("r");
        let first = ids.registration_id();
        let second = ids.registration_id();
        let mut collection = EventProcessorCollection::new();
        register(&mut collection, "projections", &first);
        register(&mut collection, "projections", &second);

        assert!(!collection.unregister(&name("projections"), &first));
        assert_eq!(collection.len(), 1);
        assert!(collection.unregister(&name("projections"), &second));
        assert!(collection.is_empty());
    }

    #[test]
    fn test_debug_lists_names_only() {
        let ids = IdGenerator::sequential("r");
        let mut collection = EventProcessorCollection::new();
        register(&mut collection, "sagas", &ids.registration_id());
        register(&mut collection, "projections", &ids.registration_id());

        assert_eq!(
            format!("{collection:?}"),
            r#"EventProcessorCollection { processors: ["projections", "sagas"] }"#
        );
    }
}
