//! Template instantiation cache.
//!
//! Each distinct `(function, domain, template args, return type, arg types)`
//! tuple receives a unique C-linkage wrapper symbol `name_n` plus generated
//! C++ source invoking the templated function. Re-requesting a seen tuple
//! returns the existing symbol and appends no text. The cache is scoped to
//! one recipe build.

use std::collections::HashMap;

use crate::unit::{KernelDomain, TemplateInstance};

#[derive(Debug, Default)]
pub struct TemplateCache {
    symbols: HashMap<TemplateInstance, String>,
    counters: HashMap<String, usize>,
    kernel_source: String,
    host_source: String,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wrapper symbol for `inst`, generating it on first use.
    pub fn instantiate(&mut self, inst: &TemplateInstance) -> String {
        if let Some(symbol) = self.symbols.get(inst) {
            return symbol.clone();
        }
        let counter = self.counters.entry(inst.func_name.clone()).or_insert(0);
        let symbol = format!("{}_{}", inst.func_name, counter);
        *counter += 1;

        let text = render_wrapper(inst, &symbol);
        match inst.domain {
            KernelDomain::Device => self.kernel_source.push_str(&text),
            KernelDomain::Host => self.host_source.push_str(&text),
        }
        self.symbols.insert(inst.clone(), symbol.clone());
        symbol
    }

    pub fn is_cached(&self, inst: &TemplateInstance) -> bool {
        self.symbols.contains_key(inst)
    }

    pub fn kernel_source(&self) -> &str {
        &self.kernel_source
    }

    pub fn host_source(&self) -> &str {
        &self.host_source
    }
}

fn render_wrapper(inst: &TemplateInstance, symbol: &str) -> String {
    let params = inst
        .arg_types
        .iter()
        .enumerate()
        .map(|(index, ty)| format!("{ty} arg{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let forwarded = (0..inst.arg_types.len())
        .map(|index| format!("arg{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let tmpl_args = inst.tmpl_args.join(", ");
    let invocation = if inst.tmpl_args.is_empty() {
        format!("{}({forwarded})", inst.func_name)
    } else {
        format!("{}<{tmpl_args}>({forwarded})", inst.func_name)
    };
    let body = if inst.ret_type == "void" {
        format!("  {invocation};")
    } else {
        format!("  return {invocation};")
    };
    match inst.domain {
        KernelDomain::Device => format!(
            "extern \"C\" __global__ void {symbol}({params}) {{\n  TRACE_CALL(\"{symbol}\");\n{body}\n}}\n\n"
        ),
        KernelDomain::Host => format!(
            "extern \"C\" DLL_EXPORT {ret} {symbol}({params}) {{\n  TRACE_CALL(\"{symbol}\");\n{body}\n}}\n\n",
            ret = inst.ret_type
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(func: &str) -> TemplateInstance {
        TemplateInstance {
            func_name: func.to_string(),
            domain: KernelDomain::Device,
            tmpl_args: vec!["float".to_string(), "OpAdd".to_string()],
            ret_type: "void".to_string(),
            arg_types: vec!["float *".to_string(), "const float *".to_string()],
        }
    }

    #[test]
    fn repeated_instantiation_is_idempotent() {
        let mut cache = TemplateCache::new();
        let first = cache.instantiate(&instance("map_binary"));
        let before = cache.kernel_source().len();
        let second = cache.instantiate(&instance("map_binary"));
        assert_eq!(first, second);
        assert_eq!(cache.kernel_source().len(), before);
    }

    #[test]
    fn distinct_tuples_get_distinct_symbols() {
        let mut cache = TemplateCache::new();
        let a = cache.instantiate(&instance("map_binary"));
        let mut other = instance("map_binary");
        other.tmpl_args[0] = "double".to_string();
        let b = cache.instantiate(&other);
        assert_ne!(a, b);
        assert_eq!(a, "map_binary_0");
        assert_eq!(b, "map_binary_1");
    }

    #[test]
    fn wrapper_invokes_template_and_trace() {
        let mut cache = TemplateCache::new();
        let symbol = cache.instantiate(&instance("map_binary"));
        let source = cache.kernel_source();
        assert!(source.contains(&format!("TRACE_CALL(\"{symbol}\")")));
        assert!(source.contains("map_binary<float, OpAdd>(arg0, arg1)"));
        assert!(source.contains("__global__"));
    }
}
