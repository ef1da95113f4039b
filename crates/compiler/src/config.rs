//! Compiler configuration.
//!
//! [`CompilerConfig`] lets an embedding driver extend the compiler with
//! additional runtime modules (robot worlds, plotting devices) without
//! modifying the core: registered modules become importable through `use`
//! directives, and their functions resolve like any builtin.
//!
//! ```rust,ignore
//! use kumc::{CompilerConfig, OptimizationLevel};
//!
//! let config = CompilerConfig::new()
//!     .with_module(my_robot_module())
//!     .with_opt_level(OptimizationLevel::None);
//! let module = kumc::compile(&mut ast, root, &config)?;
//! ```

use crate::ast::PackedFn;
use crate::modules::{self, ModuleDef};
use std::collections::HashMap;

/// How much IR optimization to run after lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    /// Lower only; locals keep memory semantics.
    None,
    /// SSA promotion, constant folding, renumbering and cleanup.
    #[default]
    Default,
}

/// Configuration for a compilation.
#[derive(Debug, Clone, Default)]
pub struct CompilerConfig {
    pub opt_level: OptimizationLevel,
    pub(crate) extra_modules: Vec<ModuleDef>,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_opt_level(mut self, level: OptimizationLevel) -> Self {
        self.opt_level = level;
        self
    }

    /// Register an additional module for `use` directives.
    pub fn with_module(mut self, module: ModuleDef) -> Self {
        self.extra_modules.push(module);
        self
    }

    /// Register a module described by a TOML manifest; native thunks are
    /// bound by mangled name.
    pub fn with_manifest(
        self,
        toml_text: &str,
        thunks: &HashMap<String, PackedFn>,
    ) -> Result<Self, String> {
        let module = modules::parse_manifest(toml_text, thunks)?;
        Ok(self.with_module(module))
    }

    pub fn modules(&self) -> &[ModuleDef] {
        &self.extra_modules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_optimizes() {
        let config = CompilerConfig::new();
        assert_eq!(config.opt_level, OptimizationLevel::Default);
        assert!(config.modules().is_empty());
    }

    #[test]
    fn builder_style_accumulates_modules() {
        let config = CompilerConfig::new()
            .with_module(modules::system_module())
            .with_opt_level(OptimizationLevel::None);
        assert_eq!(config.opt_level, OptimizationLevel::None);
        assert_eq!(config.modules().len(), 1);
    }

    #[test]
    fn manifest_modules_register() {
        let text = r#"
            [module]
            name = "весы"

            [[functions]]
            name = "вес"
            mangled = "scale_weight"
            return = "float"
        "#;
        let config = CompilerConfig::new()
            .with_manifest(text, &HashMap::new())
            .unwrap();
        assert_eq!(config.modules()[0].name, "весы");
    }
}
