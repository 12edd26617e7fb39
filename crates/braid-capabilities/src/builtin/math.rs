use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;

use braid_core::error::{BraidError, Result};
use braid_core::traits::Capability;
use braid_core::types::{CapabilityEvent, Invocation};

use super::{parse_inputs, single};

/// Binary arithmetic on two numbers. Integer operands stay integers for
/// `add`, `sub` and `mul`; everything else is computed in `f64`.
pub struct MathCapability;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Deserialize)]
struct MathInput {
    op: Op,
    a: Value,
    b: Value,
}

fn number(name: &str, v: &Value) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| BraidError::InvalidInput(format!("math: '{}' is not a number: {}", name, v)))
}

fn compute(op: Op, a: &Value, b: &Value) -> Result<Value> {
    if let (Some(x), Some(y), false) = (a.as_i64(), b.as_i64(), matches!(op, Op::Div)) {
        let result = match op {
            Op::Add => x.checked_add(y),
            Op::Sub => x.checked_sub(y),
            Op::Mul => x.checked_mul(y),
            Op::Div => None,
        };
        return result
            .map(Value::from)
            .ok_or_else(|| BraidError::InvalidInput("math: integer overflow".into()));
    }

    let x = number("a", a)?;
    let y = number("b", b)?;
    let result = match op {
        Op::Add => x + y,
        Op::Sub => x - y,
        Op::Mul => x * y,
        Op::Div => {
            if y == 0.0 {
                return Err(BraidError::InvalidInput("math: division by zero".into()));
            }
            x / y
        }
    };
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| BraidError::InvalidInput("math: result is not finite".into()))
}

impl Capability for MathCapability {
    fn name(&self) -> &str {
        "math"
    }
    fn description(&self) -> &str {
        "Apply add, sub, mul or div to numeric inputs 'a' and 'b'."
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        single(async move {
            let p: MathInput = parse_inputs("math", invocation.inputs)?;
            compute(p.op, &p.a, &p.b)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::types::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_integer_ops() {
        assert_eq!(compute(Op::Add, &json!(2), &json!(1)).unwrap(), json!(3));
        assert_eq!(compute(Op::Sub, &json!(2), &json!(5)).unwrap(), json!(-3));
        assert_eq!(compute(Op::Mul, &json!(4), &json!(5)).unwrap(), json!(20));
    }

    #[test]
    fn test_float_ops() {
        assert_eq!(compute(Op::Div, &json!(7), &json!(2)).unwrap(), json!(3.5));
        assert_eq!(compute(Op::Add, &json!(0.5), &json!(1)).unwrap(), json!(1.5));
    }

    #[test]
    fn test_rejections() {
        let err = compute(Op::Div, &json!(1), &json!(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(compute(Op::Add, &json!("x"), &json!(1)).is_err());
        assert!(compute(Op::Add, &json!(i64::MAX), &json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_invoke() {
        use futures::StreamExt;
        let mut s = MathCapability.invoke(braid_test_utils::invocation(
            json!({"op": "add", "a": 1, "b": 1}),
        ));
        assert_eq!(s.next().await.unwrap().unwrap(), CapabilityEvent::Output(json!(2)));

        let mut s = MathCapability.invoke(braid_test_utils::invocation(
            json!({"op": "pow", "a": 1, "b": 1}),
        ));
        assert!(s.next().await.unwrap().is_err());
    }
}
