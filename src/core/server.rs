//! Shared server context
//!
//! One `Server` is shared by every connection handler and holds the
//! collaborators they consult.

use std::sync::Arc;

use super::connection::ConnectionManager;
use super::hooks::{AdmissionControl, ExceptionSentinel, LogSentinel, OutboundConnector};
use crate::config::ConnConfig;
use crate::outbound::DirectConnector;

pub struct Server {
    pub admission: Arc<dyn AdmissionControl>,
    pub sentinel: Arc<dyn ExceptionSentinel>,
    pub connector: Arc<dyn OutboundConnector>,
    pub conn_manager: ConnectionManager,
    pub conn_config: ConnConfig,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }
}

#[derive(Default)]
pub struct ServerBuilder {
    admission: Option<Arc<dyn AdmissionControl>>,
    sentinel: Option<Arc<dyn ExceptionSentinel>>,
    connector: Option<Arc<dyn OutboundConnector>>,
    conn_manager: Option<ConnectionManager>,
    conn_config: Option<ConnConfig>,
}

impl ServerBuilder {
    pub fn admission(mut self, admission: Arc<dyn AdmissionControl>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn sentinel(mut self, sentinel: Arc<dyn ExceptionSentinel>) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn OutboundConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn conn_manager(mut self, manager: ConnectionManager) -> Self {
        self.conn_manager = Some(manager);
        self
    }

    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Build the server
    ///
    /// Panics if admission control is not set. The sentinel defaults to
    /// [`LogSentinel`], the connector to [`DirectConnector`].
    pub fn build(self) -> Server {
        let conn_config = self.conn_config.unwrap_or_default();
        Server {
            admission: self.admission.expect("admission control is required"),
            sentinel: self
                .sentinel
                .unwrap_or_else(|| Arc::new(LogSentinel::new())),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(DirectConnector::new(&conn_config))),
            conn_manager: self.conn_manager.unwrap_or_default(),
            conn_config,
        }
    }
}
