//! Op catalog: maps op names to schemas and to registered kernels.
//!
//! The registry is process-scoped state with explicit init-before-use: it
//! is built during startup, passed by reference into decomposition and the
//! evaluate stage, and not mutated once jobs start decomposing. No ambient
//! global exists on purpose.

use std::collections::HashMap;
use std::sync::RwLock;

use kino_common::{DeviceType, KinoError, Result};

use crate::kernel::{KernelCapabilities, KernelFactory};

/// Declared schema of one op.
#[derive(Debug, Clone)]
pub struct OpInfo {
    /// Number of inputs the op consumes.
    pub input_arity: usize,
    /// Names of the columns the op produces.
    pub output_columns: Vec<String>,
}

/// One kernel registration: capabilities plus instance factory.
#[derive(Clone)]
pub struct RegisteredKernel {
    /// Declared capabilities.
    pub capabilities: KernelCapabilities,
    /// Instance factory.
    pub factory: KernelFactory,
}

impl std::fmt::Debug for RegisteredKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredKernel")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Registry of ops and their kernels.
#[derive(Default)]
pub struct OpRegistry {
    ops: RwLock<HashMap<String, OpInfo>>,
    kernels: RwLock<HashMap<(String, DeviceType), RegisteredKernel>>,
}

impl std::fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ops = self.ops.read().map(|m| m.len()).unwrap_or_default();
        let kernels = self.kernels.read().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("OpRegistry")
            .field("ops", &ops)
            .field("kernels", &kernels)
            .finish()
    }
}

impl OpRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an op schema.
    ///
    /// Returns `true` when an existing op with the same name was replaced.
    pub fn register_op(
        &self,
        name: impl Into<String>,
        input_arity: usize,
        output_columns: Vec<String>,
    ) -> bool {
        self.ops
            .write()
            .expect("registry lock poisoned")
            .insert(
                name.into(),
                OpInfo {
                    input_arity,
                    output_columns,
                },
            )
            .is_some()
    }

    /// Register a kernel for `(op, device)`.
    ///
    /// Fails with [`KinoError::UnknownOp`] when the op was never declared.
    pub fn register_kernel(
        &self,
        op_name: &str,
        device: DeviceType,
        capabilities: KernelCapabilities,
        factory: KernelFactory,
    ) -> Result<()> {
        if !self
            .ops
            .read()
            .expect("registry lock poisoned")
            .contains_key(op_name)
        {
            return Err(KinoError::UnknownOp(op_name.to_string()));
        }
        self.kernels.write().expect("registry lock poisoned").insert(
            (op_name.to_string(), device),
            RegisteredKernel {
                capabilities,
                factory,
            },
        );
        Ok(())
    }

    /// Fetch an op's declared schema.
    pub fn op_info(&self, name: &str) -> Result<OpInfo> {
        self.ops
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| KinoError::UnknownOp(name.to_string()))
    }

    /// Resolve the kernel registered for `(op, device)`.
    pub fn resolve(&self, op_name: &str, device: DeviceType) -> Result<RegisteredKernel> {
        self.op_info(op_name)?;
        self.kernels
            .read()
            .expect("registry lock poisoned")
            .get(&(op_name.to_string(), device))
            .cloned()
            .ok_or_else(|| KinoError::NoKernelForDevice {
                op: op_name.to_string(),
                device,
            })
    }

    /// List registered op names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .ops
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use std::sync::Arc;

    fn noop_factory() -> KernelFactory {
        Arc::new(|_config: &KernelConfig| {
            Err(KinoError::Kernel(
                "test factory never instantiates".to_string(),
            ))
        })
    }

    #[test]
    fn resolve_requires_op_and_kernel() {
        let registry = OpRegistry::new();
        assert!(matches!(
            registry.resolve("histogram", DeviceType::Cpu),
            Err(KinoError::UnknownOp(_))
        ));

        registry.register_op("histogram", 1, vec!["histogram".to_string()]);
        assert!(matches!(
            registry.resolve("histogram", DeviceType::Gpu),
            Err(KinoError::NoKernelForDevice { .. })
        ));

        registry
            .register_kernel(
                "histogram",
                DeviceType::Cpu,
                KernelCapabilities::default(),
                noop_factory(),
            )
            .expect("register");
        assert!(registry.resolve("histogram", DeviceType::Cpu).is_ok());
        assert!(matches!(
            registry.resolve("histogram", DeviceType::Gpu),
            Err(KinoError::NoKernelForDevice { .. })
        ));
    }

    #[test]
    fn kernel_registration_requires_declared_op() {
        let registry = OpRegistry::new();
        let err = registry
            .register_kernel(
                "ghost",
                DeviceType::Cpu,
                KernelCapabilities::default(),
                noop_factory(),
            )
            .unwrap_err();
        assert!(matches!(err, KinoError::UnknownOp(_)));
    }

    #[test]
    fn names_are_sorted() {
        let registry = OpRegistry::new();
        registry.register_op("b", 1, vec![]);
        registry.register_op("a", 1, vec![]);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }
}
