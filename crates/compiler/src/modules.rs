//! Module registration.
//!
//! A module is a name plus a list of external functions. Each external
//! carries its source-language name (possibly Unicode), a mangled ASCII
//! name used by the native backend, AST-form parameter and return types, an
//! optional packed thunk for the stack-frame interpreter, and a flag forcing
//! string-literal arguments to be materialized into String objects before
//! the call.
//!
//! Two modules are built in: `system` (math) and `runtime` (strings,
//! arrays, I/O, assertions). Further modules can be described in TOML
//! manifests and bound to native thunks by mangled name.

use crate::ast::PackedFn;
use crate::types::Type;
use serde::Deserialize;
use std::collections::HashMap;

/// Name of the builtin math module.
pub const SYSTEM_MODULE: &str = "system";
/// Name of the builtin runtime-support module.
pub const RUNTIME_MODULE: &str = "runtime";

/// An external function in AST-type form, ready for registration.
#[derive(Debug, Clone)]
pub struct ExternalDecl {
    pub name: String,
    pub mangled: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub packed: Option<PackedFn>,
    pub requires_materialization: bool,
}

impl ExternalDecl {
    pub fn new(name: &str, mangled: &str, params: Vec<Type>, ret: Type) -> Self {
        ExternalDecl {
            name: name.to_string(),
            mangled: mangled.to_string(),
            params,
            ret,
            packed: None,
            requires_materialization: false,
        }
    }

    pub fn with_packed(mut self, packed: PackedFn) -> Self {
        self.packed = Some(packed);
        self
    }

    pub fn materialized(mut self) -> Self {
        self.requires_materialization = true;
        self
    }
}

/// A registrable module: a name and its external functions.
#[derive(Debug, Clone)]
pub struct ModuleDef {
    pub name: String,
    pub functions: Vec<ExternalDecl>,
}

/// The builtin math module.
pub fn system_module() -> ModuleDef {
    let f = Type::float;
    let i = Type::int;
    let unary_f = |name: &str, mangled: &str, packed: PackedFn| {
        ExternalDecl::new(name, mangled, vec![f()], f()).with_packed(packed)
    };
    ModuleDef {
        name: SYSTEM_MODULE.to_string(),
        functions: vec![
            unary_f("sqrt", "sqrt", |a| f64::from_bits(a[0]).sqrt().to_bits()),
            unary_f("abs", "fabs", |a| f64::from_bits(a[0]).abs().to_bits()),
            unary_f("sin", "sin", |a| f64::from_bits(a[0]).sin().to_bits()),
            unary_f("cos", "cos", |a| f64::from_bits(a[0]).cos().to_bits()),
            unary_f("tg", "tan", |a| f64::from_bits(a[0]).tan().to_bits()),
            unary_f("ctg", "cotan", |a| {
                (1.0 / f64::from_bits(a[0]).tan()).to_bits()
            }),
            unary_f("ln", "log", |a| f64::from_bits(a[0]).ln().to_bits()),
            unary_f("lg", "log10", |a| f64::from_bits(a[0]).log10().to_bits()),
            unary_f("exp", "exp", |a| f64::from_bits(a[0]).exp().to_bits()),
            ExternalDecl::new("iabs", "labs", vec![i()], i())
                .with_packed(|a| (a[0] as i64).wrapping_abs() as u64),
            ExternalDecl::new("mod", "imod", vec![i(), i()], i())
                .with_packed(|a| (a[0] as i64).rem_euclid(a[1] as i64) as u64),
            ExternalDecl::new("div", "idiv", vec![i(), i()], i())
                .with_packed(|a| (a[0] as i64).div_euclid(a[1] as i64) as u64),
            ExternalDecl::new("int", "f2i_trunc", vec![f()], i())
                .with_packed(|a| (f64::from_bits(a[0]) as i64) as u64),
        ],
    }
}

/// The runtime-support module: string reference counting, arrays, I/O,
/// power and assertions. The native entries live in the external runtime
/// library and are resolved through their mangled names; only the pure
/// arithmetic entries carry packed thunks.
pub fn runtime_module() -> ModuleDef {
    let i = Type::int;
    let f = Type::float;
    let s = Type::string;
    let sym = Type::symbol;
    let b = Type::boolean;
    let v = Type::void;
    let vp = || Type::pointer(Type::void());
    ModuleDef {
        name: RUNTIME_MODULE.to_string(),
        functions: vec![
            // String reference counting and construction.
            ExternalDecl::new("str_from_lit", "str_from_lit", vec![s()], s()),
            ExternalDecl::new("str_retain", "str_retain", vec![s()], v()),
            ExternalDecl::new("str_release", "str_release", vec![s()], v()),
            ExternalDecl::new("str_concat", "str_concat", vec![s(), s()], s()).materialized(),
            ExternalDecl::new("str_symbol_at", "str_symbol_at", vec![s(), i()], sym())
                .materialized(),
            ExternalDecl::new("str_slice", "str_slice", vec![s(), i(), i()], s()).materialized(),
            ExternalDecl::new("str_from_unicode", "str_from_unicode", vec![sym()], s()),
            // Arrays.
            ExternalDecl::new("array_create", "array_create", vec![i()], vp()),
            ExternalDecl::new("array_destroy", "array_destroy", vec![vp()], v()),
            ExternalDecl::new("array_str_destroy", "array_str_destroy", vec![vp(), i()], v()),
            // I/O.
            ExternalDecl::new("output_double", "output_double", vec![f()], v()),
            ExternalDecl::new("output_int64", "output_int64", vec![i()], v()),
            ExternalDecl::new("output_bool", "output_bool", vec![b()], v()),
            ExternalDecl::new("output_string", "output_string", vec![s()], v()).materialized(),
            ExternalDecl::new("output_symbol", "output_symbol", vec![sym()], v()),
            ExternalDecl::new("input_double", "input_double", vec![], f()),
            ExternalDecl::new("input_int64", "input_int64", vec![], i()),
            // Power; the desugaring picks by base type.
            ExternalDecl::new("pow", "pow", vec![f(), i()], f()).with_packed(|a| {
                f64::from_bits(a[0]).powi(a[1] as i64 as i32).to_bits()
            }),
            ExternalDecl::new("fpow", "fpow", vec![i(), i()], i()).with_packed(|a| {
                let base = a[0] as i64;
                let exp = a[1] as i64;
                if exp < 0 {
                    0
                } else {
                    base.wrapping_pow(exp.min(u32::MAX as i64) as u32) as u64
                }
            }),
            // Assertions; the message is a plain literal.
            ExternalDecl::new("__ensure", "kum_ensure", vec![b(), s()], v()),
        ],
    }
}

// TOML manifests.

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum ManifestType {
    Int,
    Float,
    Bool,
    String,
    Symbol,
    Void,
}

impl ManifestType {
    fn to_type(self) -> Type {
        match self {
            ManifestType::Int => Type::int(),
            ManifestType::Float => Type::float(),
            ManifestType::Bool => Type::boolean(),
            ManifestType::String => Type::string(),
            ManifestType::Symbol => Type::symbol(),
            ManifestType::Void => Type::void(),
        }
    }
}

/// Parameter passing mode: `арг`, `рез`, `арг рез`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum ManifestMode {
    In,
    Out,
    InOut,
}

fn default_mode() -> ManifestMode {
    ManifestMode::In
}

#[derive(Debug, Deserialize)]
struct ManifestArg {
    #[serde(rename = "type")]
    arg_type: ManifestType,
    #[serde(default = "default_mode")]
    mode: ManifestMode,
}

impl ManifestArg {
    fn to_type(&self) -> Type {
        let base = self.arg_type.to_type();
        match self.mode {
            ManifestMode::In => base.input_only(),
            ManifestMode::Out => Type::reference(base.output_only()),
            ManifestMode::InOut => Type::reference(base),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFn {
    name: String,
    mangled: Option<String>,
    #[serde(default)]
    args: Vec<ManifestArg>,
    #[serde(rename = "return")]
    return_type: Option<ManifestType>,
    #[serde(default)]
    requires_materialization: bool,
}

#[derive(Debug, Deserialize)]
struct ManifestHeader {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    module: ManifestHeader,
    #[serde(default)]
    functions: Vec<ManifestFn>,
}

/// Parse a module manifest. Native thunks are bound by mangled name from
/// `thunks`; entries without a thunk are still declared (the native backend
/// resolves them at link time).
pub fn parse_manifest(
    toml_text: &str,
    thunks: &HashMap<String, PackedFn>,
) -> Result<ModuleDef, String> {
    let manifest: Manifest =
        toml::from_str(toml_text).map_err(|e| format!("invalid module manifest: {}", e))?;
    let mut functions = Vec::with_capacity(manifest.functions.len());
    for f in &manifest.functions {
        let mangled = f.mangled.clone().unwrap_or_else(|| f.name.clone());
        if !mangled.is_ascii() {
            return Err(format!(
                "mangled name `{}` must be ASCII (function `{}`)",
                mangled, f.name
            ));
        }
        let mut decl = ExternalDecl::new(
            &f.name,
            &mangled,
            f.args.iter().map(ManifestArg::to_type).collect(),
            f.return_type.map_or_else(Type::void, ManifestType::to_type),
        );
        decl.packed = thunks.get(&mangled).copied();
        decl.requires_materialization = f.requires_materialization;
        functions.push(decl);
    }
    Ok(ModuleDef {
        name: manifest.module.name,
        functions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_module_thunks_compute() {
        let sys = system_module();
        let sqrt = sys.functions.iter().find(|f| f.name == "sqrt").unwrap();
        let thunk = sqrt.packed.unwrap();
        let out = thunk(&[4.0f64.to_bits()]);
        assert_eq!(f64::from_bits(out), 2.0);

        let imod = sys.functions.iter().find(|f| f.name == "mod").unwrap();
        let thunk = imod.packed.unwrap();
        assert_eq!(thunk(&[7u64, 2u64]), 1);
    }

    #[test]
    fn runtime_module_flags_materialization() {
        let rt = runtime_module();
        let concat = rt.functions.iter().find(|f| f.name == "str_concat").unwrap();
        assert!(concat.requires_materialization);
        let from_lit = rt
            .functions
            .iter()
            .find(|f| f.name == "str_from_lit")
            .unwrap();
        assert!(!from_lit.requires_materialization);
    }

    #[test]
    fn fpow_thunk_is_integer_power() {
        let rt = runtime_module();
        let fpow = rt.functions.iter().find(|f| f.name == "fpow").unwrap();
        let thunk = fpow.packed.unwrap();
        assert_eq!(thunk(&[3u64, 4u64]) as i64, 81);
    }

    #[test]
    fn manifest_parses_types_and_modes() {
        let text = r#"
            [module]
            name = "черепаха"

            [[functions]]
            name = "вперёд"
            mangled = "turtle_forward"
            args = [{ type = "float" }]

            [[functions]]
            name = "опрос"
            mangled = "turtle_poll"
            args = [{ type = "int", mode = "out" }]
            return = "bool"
            requires_materialization = true
        "#;
        let module = parse_manifest(text, &HashMap::new()).unwrap();
        assert_eq!(module.name, "черепаха");
        assert_eq!(module.functions.len(), 2);

        let forward = &module.functions[0];
        assert_eq!(forward.mangled, "turtle_forward");
        assert!(forward.params[0].is_float());
        assert!(!forward.params[0].mutable);
        assert!(forward.ret.is_void());

        let poll = &module.functions[1];
        assert!(poll.params[0].is_reference());
        let inner = poll.params[0].unwrap_ref();
        assert!(inner.mutable);
        assert!(!inner.readable);
        assert!(poll.ret.is_bool());
        assert!(poll.requires_materialization);
    }

    #[test]
    fn manifest_rejects_non_ascii_mangled_names() {
        let text = r#"
            [module]
            name = "m"

            [[functions]]
            name = "ф"
            mangled = "функция"
        "#;
        assert!(parse_manifest(text, &HashMap::new()).is_err());
    }

    #[test]
    fn manifest_binds_thunks_by_mangled_name() {
        let text = r#"
            [module]
            name = "m"

            [[functions]]
            name = "двойной"
            mangled = "twice"
            args = [{ type = "int" }]
            return = "int"
        "#;
        let mut thunks: HashMap<String, PackedFn> = HashMap::new();
        thunks.insert("twice".to_string(), |a| (a[0] as i64 * 2) as u64);
        let module = parse_manifest(text, &thunks).unwrap();
        let thunk = module.functions[0].packed.unwrap();
        assert_eq!(thunk(&[21]) as i64, 42);
    }
}
