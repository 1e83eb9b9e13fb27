//! Sandboxed expression evaluator.
//!
//! Request fields and response interceptors are computed by small expressions
//! evaluated against a `$` object. The engine is rhai: pure Rust, no
//! filesystem, network or clock surface beyond the host functions registered
//! here, with hard operation and recursion limits. One instance exists per
//! provider; instances are not shared across jobs without external locking.
//!
//! Host functions visible to scripts:
//! - `now_utc_iso8601()` / `NowUTCISO8601()` - current UTC time, ISO-8601
//! - `rsa_sign_sha256(value, pem [, password])` / `RSASignSHA256(...)` -
//!   RSA-SHA256 signature, output encoding per provider config
//! - `native_log(value)` / `NativeLog(value)` - log through the host sink

use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use courier_domain::{CourierError, CourierResult, SignatureOutput};
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use tracing::info;

use crate::crypto;

/// Scope variable the `$` token is rewritten to before compilation; `$` is
/// not a legal rhai identifier.
const DOLLAR_VAR: &str = "__it";

/// Helpers prepended to every loaded script set.
const PRELUDE: &str = r#"
fn _log(v) { native_log(v) }
"#;

/// Per-provider expression sandbox.
pub struct Evaluator {
    engine: Engine,
    lib: AST,
}

impl Evaluator {
    /// Compile the prelude plus every `*.rhai` file in `scripts_dir` (sorted
    /// by name, so load order is stable across hosts).
    pub fn load(scripts_dir: Option<&Path>, output: SignatureOutput) -> CourierResult<Self> {
        let mut engine = Engine::new();
        engine.set_max_operations(250_000);
        engine.set_max_call_levels(32);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_string_size(1024 * 1024);
        engine.set_max_array_size(16 * 1024);
        engine.set_max_map_size(16 * 1024);
        engine.disable_symbol("eval");

        register_host_functions(&mut engine, output);

        let mut source = String::from(PRELUDE);
        if let Some(dir) = scripts_dir {
            for path in script_files(dir)? {
                let script = fs::read_to_string(&path).map_err(|e| {
                    CourierError::Config(format!("cannot read script {}: {e}", path.display()))
                })?;
                source.push('\n');
                source.push_str(&script);
            }
        }
        let lib = engine.compile(&source).map_err(|e| {
            CourierError::Config(format!("script compilation failed: {e}"))
        })?;

        Ok(Self { engine, lib })
    }

    /// Evaluate `expression` with `$` bound to `object`. Returns the result
    /// as a JSON value; sandbox errors surface as [`CourierError::Evaluation`]
    /// carrying the engine's message.
    pub fn evaluate(
        &self,
        object: &serde_json::Value,
        expression: &str,
    ) -> CourierResult<serde_json::Value> {
        let rewritten = rewrite_dollar(expression);
        let expr = self
            .engine
            .compile_expression(&rewritten)
            .map_err(|e| CourierError::Evaluation(e.to_string()))?;
        let mut ast = self.lib.clone_functions_only();
        ast += expr;

        let mut scope = Scope::new();
        let object = rhai::serde::to_dynamic(object)
            .map_err(|e| CourierError::Evaluation(e.to_string()))?;
        scope.push_dynamic(DOLLAR_VAR, object);

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| CourierError::Evaluation(e.to_string()))?;
        rhai::serde::from_dynamic(&result).map_err(|e| CourierError::Evaluation(e.to_string()))
    }
}

fn register_host_functions(engine: &mut Engine, output: SignatureOutput) {
    engine.register_fn("now_utc_iso8601", now_utc_iso8601);
    engine.register_fn("NowUTCISO8601", now_utc_iso8601);

    let sign2 =
        move |value: String, pem: String| -> Result<String, Box<EvalAltResult>> {
            crypto::rsa_sign_sha256(&value, &pem, None, output)
                .map_err(|e| e.to_string().into())
        };
    let sign3 = move |value: String, pem: String, pwd: String| -> Result<String, Box<EvalAltResult>> {
        crypto::rsa_sign_sha256(&value, &pem, Some(&pwd), output)
            .map_err(|e| e.to_string().into())
    };
    engine.register_fn("rsa_sign_sha256", sign2);
    engine.register_fn("rsa_sign_sha256", sign3);
    engine.register_fn("RSASignSHA256", sign2);
    engine.register_fn("RSASignSHA256", sign3);

    engine.register_fn("native_log", native_log);
    engine.register_fn("NativeLog", native_log);
}

fn now_utc_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn native_log(value: Dynamic) {
    info!(target: "courier::script", "{value}");
}

fn script_files(dir: &Path) -> CourierResult<Vec<std::path::PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        CourierError::Config(format!("cannot read scripts dir {}: {e}", dir.display()))
    })?;
    let mut files: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "rhai"))
        .collect();
    files.sort();
    Ok(files)
}

/// Replace bare `$` tokens with the scope variable, leaving string literal
/// contents untouched.
fn rewrite_dollar(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len() + 16);
    let mut chars = expression.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                '$' => out.push_str(DOLLAR_VAR),
                _ => out.push(c),
            },
        }
    }
    out
}
