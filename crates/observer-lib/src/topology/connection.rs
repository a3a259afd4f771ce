//! Lazily created, self-healing directory client

use super::directory::DirectoryService;
use crate::error::DirectoryError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type ClientFactory<C> = Box<dyn Fn() -> Result<Arc<C>, DirectoryError> + Send + Sync>;

enum ConnectionState<C: ?Sized> {
    Uninitialized,
    Live(Arc<C>),
    Closed,
}

/// Owns the one directory client shared by every component.
///
/// The client is created on first use and recreated the next time it is
/// requested after it reports itself closed or was invalidated.
pub struct ConnectionManager<C: ?Sized = dyn DirectoryService> {
    factory: ClientFactory<C>,
    state: Mutex<ConnectionState<C>>,
    created: AtomicUsize,
}

impl<C: DirectoryService + ?Sized> ConnectionManager<C> {
    pub fn new(
        factory: impl Fn() -> Result<Arc<C>, DirectoryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            state: Mutex::new(ConnectionState::Uninitialized),
            created: AtomicUsize::new(0),
        }
    }

    /// Manager around an already constructed client
    pub fn with_client(client: Arc<C>) -> Self
    where
        C: 'static,
    {
        let factory_client = client.clone();
        let manager = Self::new(move || Ok(factory_client.clone()));
        if let Ok(mut state) = manager.state.lock() {
            *state = ConnectionState::Live(client);
        }
        manager.created.store(1, Ordering::Relaxed);
        manager
    }

    /// Return the live client, creating or recreating it when needed
    pub fn get_or_create(&self) -> Result<Arc<C>, DirectoryError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DirectoryError::Other("connection state lock poisoned".to_string()))?;

        match &*state {
            ConnectionState::Live(client) if !client.is_closed() => return Ok(client.clone()),
            ConnectionState::Live(_) => debug!("Directory client closed, recreating"),
            ConnectionState::Closed => debug!("Directory client invalidated, recreating"),
            ConnectionState::Uninitialized => {}
        }

        let client = (self.factory)()?;
        let generation = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation, "Directory client created");
        *state = ConnectionState::Live(client.clone());
        Ok(client)
    }

    /// Mark the current client unusable so the next request rebuilds it
    pub fn invalidate(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = ConnectionState::Closed;
        }
    }

    pub fn is_live(&self) -> bool {
        self.state
            .lock()
            .map(|s| matches!(&*s, ConnectionState::Live(c) if !c.is_closed()))
            .unwrap_or(false)
    }

    /// Number of clients created so far
    pub fn generation(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}
