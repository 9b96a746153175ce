//! Demo services exposed by `jsonlink serve`.

use serde_json::{Value, json};

use jsonlink_rpc::{HandlerError, Params, ServiceBinding, ServiceMap, handler_fn, sync_fn};

/// Every demo binding, in registration order.
pub fn all() -> Vec<ServiceBinding> {
    vec![echo(), math(), ping()]
}

/// `echo(value)` returns its first parameter.
pub fn echo() -> ServiceBinding {
    ServiceBinding::function("echo", sync_fn(|params| params.get::<Value>(0)))
}

/// `math.add(a, b)` and `math.subtract(a, b)`.
pub fn math() -> ServiceBinding {
    ServiceBinding::group(
        "math",
        ServiceMap::new()
            .method("add", sync_fn(|params| arithmetic(&params, |a, b| a.checked_add(b))))
            .method(
                "subtract",
                sync_fn(|params| arithmetic(&params, |a, b| a.checked_sub(b))),
            ),
    )
}

/// `ping()` answers `"pong"`, optionally after `delay_ms`.
pub fn ping() -> ServiceBinding {
    ServiceBinding::function(
        "ping",
        handler_fn(|params: Params| async move {
            if let Some(delay) = params.value(0).and_then(Value::as_u64) {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            Ok::<_, HandlerError>(json!("pong"))
        }),
    )
}

fn arithmetic(params: &Params, op: impl Fn(i64, i64) -> Option<i64>) -> Result<Value, HandlerError> {
    let a: i64 = params.get(0)?;
    let b: i64 = params.get(1)?;
    op(a, b)
        .map(|n| json!(n))
        .ok_or_else(|| HandlerError::new("integer overflow"))
}
