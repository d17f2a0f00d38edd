//! The recipe: generated source text plus ordered init/exec/dispose calls.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calls::{DriverCall, EventFlags, StreamFlags};
use crate::env::CompileEnv;
use crate::instantiate::TemplateCache;
use crate::scheduler::StreamSchedule;
use crate::unit::ExecPlan;

/// Frozen recipe format version enforced on load.
pub const RECIPE_VERSION: &str = "texpr-recipe.v1";

const KERNEL_PRELUDE: &str = "\
#include \"Utils.cuh\"
#include \"NDSupport.cuh\"
#include \"Subtensor.cuh\"
#include \"Ops.cuh\"

";

const HOST_PRELUDE: &str = "\
#include \"Utils.cuh\"
#include \"NDSupport.cuh\"
#include \"Subtensor.cuh\"
#include \"Ops.cuh\"
#include \"ThrustInterface.cuh\"
#include \"Reduce.cuh\"
#include <stdio.h>

";

/// The compiler's output artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub version: String,
    pub kernel_code: String,
    pub host_code: String,
    pub init_calls: Vec<DriverCall>,
    pub dispose_calls: Vec<DriverCall>,
    pub exec_calls: Vec<DriverCall>,
}

#[derive(Debug, Error)]
pub enum RecipeSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("recipe version '{found}' does not match expected '{expected}'")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Recipe {
    pub fn to_json_string(&self) -> Result<String, RecipeSerdeError> {
        serde_json::to_string_pretty(self).map_err(RecipeSerdeError::from)
    }

    pub fn from_json_str(text: &str) -> Result<Recipe, RecipeSerdeError> {
        let recipe: Recipe = serde_json::from_str(text)?;
        if recipe.version != RECIPE_VERSION {
            return Err(RecipeSerdeError::VersionMismatch {
                found: recipe.version,
                expected: RECIPE_VERSION,
            });
        }
        Ok(recipe)
    }

    /// Human-readable listing of the three call sections.
    pub fn render_calls(&self) -> String {
        let mut text = String::new();
        for (title, calls) in [
            ("init", &self.init_calls),
            ("exec", &self.exec_calls),
            ("dispose", &self.dispose_calls),
        ] {
            text.push_str(title);
            text.push_str(":\n");
            for call in calls {
                text.push_str("  ");
                text.push_str(&call.to_string());
                text.push('\n');
            }
        }
        text
    }
}

/// Collates generated source with resource management calls.
///
/// Init creates memory, streams and events (in that order), uploads
/// host-resident inputs, and optionally replays the steady-state calls once
/// as warmup. Dispose releases everything in reverse order of creation.
pub(crate) fn assemble(
    plan: &ExecPlan,
    schedule: &StreamSchedule,
    exec_calls: Vec<DriverCall>,
    init_unit_calls: Vec<DriverCall>,
    cache: &TemplateCache,
    env: &CompileEnv,
) -> Recipe {
    let stream_count = schedule.streams.len().max(1);
    let event_count = schedule.event_object_count;

    let mut init_calls = Vec::new();
    for alloc in &plan.allocs {
        init_calls.push(DriverCall::MemAlloc {
            alloc: alloc.clone(),
        });
    }
    for id in 0..stream_count {
        init_calls.push(DriverCall::StreamCreate {
            id,
            flags: StreamFlags::NonBlocking,
        });
    }
    for id in 0..event_count {
        init_calls.push(DriverCall::EventCreate {
            id,
            flags: EventFlags::default(),
        });
    }
    init_calls.extend(init_unit_calls);
    if env.warmup {
        init_calls.extend(exec_calls.iter().cloned());
    }

    let mut dispose_calls = Vec::new();
    for id in (0..event_count).rev() {
        dispose_calls.push(DriverCall::EventDestroy { id });
    }
    for id in (0..stream_count).rev() {
        dispose_calls.push(DriverCall::StreamDestroy { id });
    }
    for alloc in plan.allocs.iter().rev() {
        dispose_calls.push(DriverCall::MemFree { alloc: alloc.id });
    }

    Recipe {
        version: RECIPE_VERSION.to_string(),
        kernel_code: format!("{KERNEL_PRELUDE}{}", cache.kernel_source()),
        host_code: format!("{HOST_PRELUDE}{}", cache.host_source()),
        init_calls,
        dispose_calls,
        exec_calls,
    }
}
