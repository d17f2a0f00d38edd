use std::collections::HashMap;

use texpr::VarSpec;

use crate::error::PlanError;

/// Where an external variable's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarPlacement {
    Host,
    Dev,
}

/// Per-compilation environment: variable placements and feature toggles.
#[derive(Debug, Clone, Default)]
pub struct CompileEnv {
    placement: HashMap<VarSpec, VarPlacement>,
    /// Replay the steady-state calls once during init to prime driver JIT
    /// caches.
    pub warmup: bool,
    /// Append a trace op to every compute unit.
    pub debug_trace: bool,
}

impl CompileEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn place(mut self, var: VarSpec, placement: VarPlacement) -> Self {
        self.placement.insert(var, placement);
        self
    }

    pub fn with_warmup(mut self) -> Self {
        self.warmup = true;
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.debug_trace = true;
        self
    }

    pub fn placement_of(&self, var: &VarSpec) -> Result<VarPlacement, PlanError> {
        self.placement
            .get(var)
            .copied()
            .ok_or_else(|| PlanError::PlacementMissing {
                var: var.to_string(),
            })
    }
}
