//! # Driver Registry
//!
//! Maps engine types to driver constructors.
//!
//! ## Overview
//!
//! Registration happens once at startup through [`DriverRegistryBuilder`].
//! The finished [`DriverRegistry`] is immutable: it can be used directly
//! (tests, embedded callers) or published process-wide with
//! [`DriverRegistry::install`], after which [`DriverRegistry::global`] returns
//! it without locking.
//!
//! ## Usage
//!
//! ```rust
//! use schemaflow_core::db::{register_builtin_drivers, DriverConfig, DriverRegistry, EngineType};
//!
//! let registry = register_builtin_drivers(DriverRegistry::builder())
//!     .unwrap()
//!     .build();
//! let driver = registry.create(EngineType::Postgres, DriverConfig::default()).unwrap();
//! assert!(!driver.is_open());
//! ```

use super::driver::{Driver, DriverConfig, DriverConstructor};
use super::types::{ConnectionConfig, ConnectionContext, EngineType};
use crate::context::OperationContext;
use crate::error::{Result, SchemaflowError};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, info};

static GLOBAL_REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();

#[derive(Debug, Default)]
pub struct DriverRegistryBuilder {
    constructors: HashMap<EngineType, DriverConstructor>,
}

impl DriverRegistryBuilder {
    /// Register `constructor` for `engine`; registering an engine twice is an error
    pub fn register(mut self, engine: EngineType, constructor: DriverConstructor) -> Result<Self> {
        if self.constructors.contains_key(&engine) {
            return Err(SchemaflowError::Validation(format!(
                "Driver for engine {engine} is already registered"
            )));
        }
        debug!(engine = %engine, "Registered driver");
        self.constructors.insert(engine, constructor);
        Ok(self)
    }

    pub fn build(self) -> DriverRegistry {
        DriverRegistry {
            constructors: self.constructors,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverRegistry {
    constructors: HashMap<EngineType, DriverConstructor>,
}

impl DriverRegistry {
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder::default()
    }

    /// Publish this registry for the whole process. Only the first call wins.
    pub fn install(self) -> Result<&'static DriverRegistry> {
        let engines = self.registered_engines();
        GLOBAL_REGISTRY.set(self).map_err(|_| {
            SchemaflowError::Configuration("Driver registry is already installed".to_string())
        })?;
        info!(engines = ?engines, "Driver registry installed");
        GLOBAL_REGISTRY
            .get()
            .ok_or_else(|| SchemaflowError::Internal("Driver registry vanished".to_string()))
    }

    pub fn global() -> Result<&'static DriverRegistry> {
        GLOBAL_REGISTRY.get().ok_or_else(|| {
            SchemaflowError::Configuration("Driver registry has not been installed".to_string())
        })
    }

    /// Construct an unopened driver for `engine`
    pub fn create(&self, engine: EngineType, config: DriverConfig) -> Result<Box<dyn Driver>> {
        let constructor = self.constructors.get(&engine).ok_or_else(|| {
            SchemaflowError::Configuration(format!("No driver registered for engine {engine}"))
        })?;
        Ok(constructor(config))
    }

    /// Construct and open a driver in one step
    pub async fn open(
        &self,
        ctx: &OperationContext,
        engine: EngineType,
        driver_config: DriverConfig,
        config: &ConnectionConfig,
        connection: &ConnectionContext,
    ) -> Result<Box<dyn Driver>> {
        let mut driver = self.create(engine, driver_config)?;
        driver.open(ctx, engine, config, connection).await?;
        Ok(driver)
    }

    pub fn is_registered(&self, engine: EngineType) -> bool {
        self.constructors.contains_key(&engine)
    }

    pub fn registered_engines(&self) -> Vec<EngineType> {
        let mut engines: Vec<EngineType> = self.constructors.keys().copied().collect();
        engines.sort();
        engines
    }
}

/// Register the PostgreSQL and ClickHouse drivers
pub fn register_builtin_drivers(builder: DriverRegistryBuilder) -> Result<DriverRegistryBuilder> {
    builder
        .register(EngineType::Postgres, super::postgres::new_driver)?
        .register(EngineType::ClickHouse, super::clickhouse::new_driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_duplicate_registration_rejected() {
        let builder = DriverRegistry::builder()
            .register(EngineType::Postgres, crate::db::postgres::new_driver)
            .unwrap();
        let err = builder
            .register(EngineType::Postgres, crate::db::postgres::new_driver)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_unregistered_engine_is_configuration_error() {
        let registry = DriverRegistry::builder()
            .register(EngineType::Postgres, crate::db::postgres::new_driver)
            .unwrap()
            .build();
        let err = registry
            .create(EngineType::ClickHouse, DriverConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_builtin_drivers() {
        let registry = register_builtin_drivers(DriverRegistry::builder())
            .unwrap()
            .build();
        assert_eq!(
            registry.registered_engines(),
            vec![EngineType::Postgres, EngineType::ClickHouse]
        );
        let driver = registry
            .create(EngineType::ClickHouse, DriverConfig::default())
            .unwrap();
        assert_eq!(driver.engine(), EngineType::ClickHouse);
        assert!(!driver.is_open());
    }
}
