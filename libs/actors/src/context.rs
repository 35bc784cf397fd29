//! Runtime context
//!
//! Built once at process entry and passed to every object constructor:
//! configuration, the remote directory and the RPC runtime.

use crate::error::{Result, RuntimeError};
use crate::registry::{LocalDirectory, RemoteDirectory};
use crate::retry::RetryPolicy;
use crate::transport::{LocalRpcRuntime, RpcRuntime};
use plant_config::RuntimeConfig;
use plant_types::NodeId;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct RuntimeContext {
    config: Arc<RuntimeConfig>,
    directory: Arc<dyn RemoteDirectory>,
    rpc: Arc<dyn RpcRuntime>,
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("node", &self.node())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    pub fn new(
        config: RuntimeConfig,
        directory: Arc<dyn RemoteDirectory>,
        rpc: Arc<dyn RpcRuntime>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RuntimeError::configuration(e.to_string(), Some(e.field)))?;
        Ok(Self {
            config: Arc::new(config),
            directory,
            rpc,
        })
    }

    /// Context backed by the in-process directory and RPC runtime
    pub fn local(config: RuntimeConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(LocalDirectory::new()),
            Arc::new(LocalRpcRuntime::new()),
        )
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<dyn RemoteDirectory> {
        &self.directory
    }

    pub fn rpc(&self) -> &Arc<dyn RpcRuntime> {
        &self.rpc
    }

    pub fn node(&self) -> NodeId {
        NodeId::new(self.config.node_id)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig {
            mailbox_capacity: 0,
            ..RuntimeConfig::default()
        };
        let err = RuntimeContext::local(config).unwrap_err();
        match err {
            RuntimeError::Configuration { field, .. } => {
                assert_eq!(field.as_deref(), Some("mailbox_capacity"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_local_context() {
        let ctx = RuntimeContext::local(RuntimeConfig::default()).unwrap();
        assert_eq!(ctx.node(), NodeId::new(0));
        assert_eq!(ctx.retry_policy().attempts(), 2);
        assert!(ctx.rpc().is_accepting());
        assert!(ctx.directory().list().is_empty());
    }
}
