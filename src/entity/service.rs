use super::{BoxedActiveEntity, BoxedPassiveEntity};
use crate::core::{ConsumerId, EntityError};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Factory for one family of entity types at one version.
pub trait ServerEntityService: Send + Sync {
    fn handles_entity_type(&self, type_name: &str) -> bool;

    fn version(&self) -> u64;

    fn create_active_entity(
        &self,
        registry: ServiceRegistry,
        configuration: &[u8],
    ) -> Result<BoxedActiveEntity, EntityError>;

    fn create_passive_entity(
        &self,
        registry: ServiceRegistry,
        configuration: &[u8],
    ) -> Result<BoxedPassiveEntity, EntityError>;
}

/// Supplies auxiliary services to the consumers of a server process.
pub trait ServiceProvider: Send + Sync {
    /// Returns the service of type `service_type` for `consumer_id`, if this
    /// provider offers one.
    fn provide(
        &self,
        consumer_id: ConsumerId,
        service_type: TypeId,
    ) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Provider handing the same instance to every consumer.
pub struct SharedServiceProvider<T> {
    service: Arc<T>,
}

impl<T: Any + Send + Sync> SharedServiceProvider<T> {
    pub fn new(service: Arc<T>) -> Self {
        Self { service }
    }
}

impl<T: Any + Send + Sync> ServiceProvider for SharedServiceProvider<T> {
    fn provide(
        &self,
        _consumer_id: ConsumerId,
        service_type: TypeId,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        if service_type == TypeId::of::<T>() {
            let service: Arc<dyn Any + Send + Sync> = self.service.clone();
            Some(service)
        } else {
            None
        }
    }
}

/// Service lookup bound to a single consumer.
#[derive(Clone)]
pub struct ServiceRegistry {
    consumer_id: ConsumerId,
    providers: Arc<Vec<Arc<dyn ServiceProvider>>>,
}

impl ServiceRegistry {
    pub(crate) fn new(consumer_id: ConsumerId, providers: Arc<Vec<Arc<dyn ServiceProvider>>>) -> Self {
        Self {
            consumer_id,
            providers,
        }
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// First service of type `T` offered by the registered providers, in
    /// registration order.
    pub fn get_service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.providers.iter().find_map(|provider| {
            provider
                .provide(self.consumer_id, TypeId::of::<T>())
                .and_then(|service| service.downcast::<T>().ok())
        })
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("consumer_id", &self.consumer_id)
            .field("providers", &self.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Counter(Mutex<u64>);

    struct PerConsumerName;

    impl ServiceProvider for PerConsumerName {
        fn provide(
            &self,
            consumer_id: ConsumerId,
            service_type: TypeId,
        ) -> Option<Arc<dyn Any + Send + Sync>> {
            (service_type == TypeId::of::<String>())
                .then(|| Arc::new(format!("consumer-{}", consumer_id)) as Arc<dyn Any + Send + Sync>)
        }
    }

    #[test]
    fn test_shared_provider_hands_out_one_instance() {
        let counter = Arc::new(Counter(Mutex::new(0)));
        let providers: Vec<Arc<dyn ServiceProvider>> =
            vec![Arc::new(SharedServiceProvider::new(counter.clone()))];
        let providers = Arc::new(providers);

        let a = ServiceRegistry::new(1, providers.clone());
        let b = ServiceRegistry::new(2, providers);
        *a.get_service::<Counter>().unwrap().0.lock().unwrap() += 1;
        *b.get_service::<Counter>().unwrap().0.lock().unwrap() += 1;
        assert_eq!(*counter.0.lock().unwrap(), 2);
        assert!(a.get_service::<String>().is_none());
    }

    #[test]
    fn test_providers_see_the_consumer_id() {
        let providers: Vec<Arc<dyn ServiceProvider>> = vec![Arc::new(PerConsumerName)];
        let registry = ServiceRegistry::new(7, Arc::new(providers));
        assert_eq!(registry.consumer_id(), 7);
        assert_eq!(registry.get_service::<String>().unwrap().as_str(), "consumer-7");
    }
}
