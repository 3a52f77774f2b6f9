//! Method registration and argument extraction.
//!
//! Servers never reflect over objects: every callable method is registered
//! by name in a [`MethodTable`] when the server is built. The table doubles
//! as the allow-list reported by `ro_list` and `ro_help`.

use futures::future::BoxFuture;
use remora_core::{Fault, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Boxed future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, Fault>>;

/// Type-erased method handler.
pub type Handler = Arc<dyn Fn(CallContext, Args) -> HandlerFuture + Send + Sync>;

/// Per-call information passed to handlers.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Method being invoked.
    pub method: String,
    /// Authenticated user, when the server checks credentials.
    pub user: Option<String>,
    /// Address of the calling peer.
    pub peer: Option<SocketAddr>,
}

/// Positional call arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(args: Vec<Value>) -> Self {
        Self(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }

    /// Argument `idx`, if supplied.
    pub fn optional(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    /// Argument `idx`, required.
    pub fn value(&self, idx: usize) -> Result<&Value, Fault> {
        self.0.get(idx).ok_or_else(|| {
            Fault::invalid_arguments(format!(
                "missing argument {} (got {} arguments)",
                idx,
                self.0.len()
            ))
        })
    }

    pub fn str(&self, idx: usize) -> Result<String, Fault> {
        let value = self.value(idx)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch(idx, "string", value))
    }

    pub fn i64(&self, idx: usize) -> Result<i64, Fault> {
        let value = self.value(idx)?;
        value.as_i64().ok_or_else(|| mismatch(idx, "int", value))
    }

    pub fn f64(&self, idx: usize) -> Result<f64, Fault> {
        let value = self.value(idx)?;
        value.as_f64().ok_or_else(|| mismatch(idx, "double", value))
    }

    pub fn port(&self, idx: usize) -> Result<u16, Fault> {
        let raw = self.i64(idx)?;
        u16::try_from(raw)
            .map_err(|_| Fault::invalid_arguments(format!("argument {}: {} is not a port", idx, raw)))
    }

    /// Boolean argument, `default` when absent or nil.
    pub fn bool_or(&self, idx: usize, default: bool) -> Result<bool, Fault> {
        match self.0.get(idx) {
            None | Some(Value::Nil) => Ok(default),
            Some(value) => value.as_bool().ok_or_else(|| mismatch(idx, "bool", value)),
        }
    }

    /// A string or list of strings.
    pub fn strings(&self, idx: usize) -> Result<Vec<String>, Fault> {
        let value = self.value(idx)?;
        value
            .as_string_list()
            .ok_or_else(|| mismatch(idx, "string or list of strings", value))
    }

    /// A struct argument; absent or nil yields an empty struct.
    pub fn struct_or_empty(&self, idx: usize) -> Result<Value, Fault> {
        match self.0.get(idx) {
            None | Some(Value::Nil) => Ok(Value::empty_struct()),
            Some(value @ Value::Struct(_)) => Ok(value.clone()),
            Some(value) => Err(mismatch(idx, "struct", value)),
        }
    }
}

fn mismatch(idx: usize, expected: &str, got: &Value) -> Fault {
    Fault::invalid_arguments(format!(
        "argument {}: expected {}, got {}",
        idx,
        expected,
        got.type_name()
    ))
}

/// One registered method.
#[derive(Clone)]
pub struct Method {
    name: String,
    params: Vec<String>,
    doc: String,
    handler: Handler,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// `name(param, ...)`
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.params.join(", "))
    }

    /// Signature and doc text as returned by `ro_help`.
    pub fn help(&self) -> String {
        format!("{}\n{}", self.signature(), self.doc)
    }

    pub(crate) fn handler(&self) -> Handler {
        self.handler.clone()
    }

    /// Run the handler in the current task.
    pub async fn call(&self, ctx: CallContext, args: Args) -> Result<Value, Fault> {
        (self.handler)(ctx, args).await
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Explicit name-to-handler registration table.
#[derive(Clone, Default, Debug)]
pub struct MethodTable {
    methods: BTreeMap<String, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, name: &str, params: &[&str], doc: &str, handler: F) -> &mut Self
    where
        F: Fn(CallContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, args| Box::pin(handler(ctx, args)));
        self.methods.insert(
            name.to_string(),
            Method {
                name: name.to_string(),
                params: params.iter().map(|p| p.to_string()).collect(),
                doc: doc.to_string(),
                handler,
            },
        );
        self
    }

    /// Add every method of `other`; entries in `other` win on conflict.
    pub fn merge(&mut self, other: MethodTable) -> &mut Self {
        self.methods.extend(other.methods);
        self
    }

    /// Call `method` in-process, bypassing transport and authentication.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        let entry = self
            .get(method)
            .ok_or_else(|| Fault::unsupported_method(method))?;
        let ctx = CallContext {
            method: method.to_string(),
            ..CallContext::default()
        };
        entry.call(ctx, Args::new(args)).await
    }

    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Sorted method names.
    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Method> {
        self.methods.values()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut table = MethodTable::new();
        table.register("add", &["a", "b"], "Add two integers.", |_ctx, args| async move {
            Ok(Value::Int(args.i64(0)? + args.i64(1)?))
        });

        let method = table.get("add").unwrap();
        assert_eq!(method.help(), "add(a, b)\nAdd two integers.");

        let handler = method.handler();
        let args = Args::new(vec![Value::Int(2), Value::Int(3)]);
        assert_eq!(handler(CallContext::default(), args).await, Ok(Value::Int(5)));

        let bad = Args::new(vec![Value::Int(2), Value::from("x")]);
        let fault = handler(CallContext::default(), bad).await.unwrap_err();
        assert_eq!(fault.code, Fault::INVALID_ARGUMENTS);
    }

    #[test]
    fn test_merge_and_names_are_sorted() {
        let mut a = MethodTable::new();
        a.register("zeta", &[], "", |_, _| async { Ok(Value::Nil) });
        let mut b = MethodTable::new();
        b.register("alpha", &[], "", |_, _| async { Ok(Value::Nil) });

        a.merge(b);
        assert_eq!(a.names(), vec!["alpha", "zeta"]);
        assert!(a.contains("alpha"));
    }

    #[tokio::test]
    async fn test_invoke_unknown_method() {
        let table = MethodTable::new();
        let fault = table.invoke("nope", vec![]).await.unwrap_err();
        assert_eq!(fault.code, Fault::UNSUPPORTED_METHOD);
    }

    #[test]
    fn test_arg_helpers() {
        let args = Args::new(vec![
            Value::from("chan"),
            Value::Nil,
            Value::Int(70000),
        ]);
        assert_eq!(args.strings(0).unwrap(), vec!["chan"]);
        assert!(args.bool_or(1, true).unwrap());
        assert!(args.bool_or(9, false).is_ok());
        assert!(args.port(2).is_err());
        assert_eq!(args.struct_or_empty(1).unwrap(), Value::empty_struct());
        assert!(args.struct_or_empty(0).is_err());
        assert!(args.value(3).is_err());
    }
}
