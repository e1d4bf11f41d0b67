//! Closure-backed tools: sync, async, and typed-argument variants.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{Tool, ToolContext, ToolFailure, ToolSpec};

type Handler =
    Arc<dyn Fn(ToolContext, Map<String, Value>) -> BoxFuture<'static, Result<Value, ToolFailure>> + Send + Sync>;

/// A tool whose body is a plain function or closure.
#[derive(Clone)]
pub struct FnTool {
    spec: ToolSpec,
    handler: Handler,
}

impl FnTool {
    /// Binds a synchronous function.
    pub fn sync<F, T, E>(spec: ToolSpec, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Result<T, E> + Send + Sync + 'static,
        T: Serialize + 'static,
        E: std::fmt::Display + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |_ctx: ToolContext, args: Map<String, Value>| {
            let f = Arc::clone(&f);
            async move { flatten(f(args)) }.boxed()
        });
        Self { spec, handler }
    }

    /// Binds an asynchronous function.
    pub fn asynchronous<F, Fut, T, E>(spec: ToolSpec, f: F) -> Self
    where
        F: Fn(ToolContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + 'static,
        E: std::fmt::Display + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: ToolContext, args: Map<String, Value>| {
            let fut = f(ctx, args);
            async move { flatten(fut.await) }.boxed()
        });
        Self { spec, handler }
    }

    /// Binds an asynchronous function taking a typed argument struct. The
    /// validated map is decoded into `A` before the call.
    pub fn typed<A, F, Fut, T, E>(spec: ToolSpec, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(ToolContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + 'static,
        E: std::fmt::Display + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |ctx: ToolContext, args: Map<String, Value>| {
            let f = Arc::clone(&f);
            async move {
                let typed: A = serde_json::from_value(Value::Object(args))
                    .map_err(ToolFailure::from_error)?;
                flatten(f(ctx, typed).await)
            }
            .boxed()
        });
        Self { spec, handler }
    }
}

/// Turns a typed return value into a plain serializable mapping.
fn flatten<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> Result<Value, ToolFailure> {
    let value = result.map_err(ToolFailure::from_error)?;
    serde_json::to_value(value).map_err(ToolFailure::from_error)
}

#[async_trait]
impl Tool for FnTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Value, ToolFailure> {
        (self.handler)(ctx.clone(), args).await
    }
}
