//! User data key functions.
//!
//! Function datasources generate samples with a *value function*
//! `(time, prevValue)`. Any key may carry a *post-processing function*
//! `(time, value, prevValue, timePrev, prevOrigValue)` applied to every
//! landed sample. Bodies arrive as source text and are compiled through the
//! [`ScriptCompiler`] seam.
//!
//! [`ExpressionCompiler`] runs each body as a Lua function inside its own
//! interpreter with only the `math`, `string` and `table` libraries loaded.
//! A bare expression is accepted as well as a statement block ending in
//! `return`. A `Math` table carries the helpers dashboard scripts use.
//!
//! ```text
//! return Math.round(value * 1.8 + 32);
//! prevValue + Math.sin(time / 5000) * 10
//! local c = value - 273.15 return c > 0 and c or 0
//! ```

use crate::error::ScriptError;
use crate::value::number_value;
use async_trait::async_trait;
use mlua::{Function, Lua, LuaOptions, LuaSerdeExt, MultiValue, StdLib, Value as LuaValue};
use serde_json::Value;
use std::sync::Arc;

pub type ValueFunction = Arc<dyn Fn(i64, &Value) -> Result<Value, ScriptError> + Send + Sync>;

pub type PostFunction = Arc<dyn Fn(&PostArgs<'_>) -> Result<Value, ScriptError> + Send + Sync>;

/// Arguments of a post-processing call.
#[derive(Debug, Clone, Copy)]
pub struct PostArgs<'a> {
    pub time: i64,
    pub value: &'a Value,
    /// Previous processed value of the same key.
    pub prev_value: &'a Value,
    /// Timestamp of the previous original sample.
    pub time_prev: i64,
    /// Previous original (pre-transform) value.
    pub prev_orig_value: &'a Value,
}

#[async_trait]
pub trait ScriptCompiler: Send + Sync {
    async fn compile_value_function(&self, body: &str) -> Result<ValueFunction, ScriptError>;

    async fn compile_post_function(&self, body: &str) -> Result<PostFunction, ScriptError>;
}

const VALUE_PARAMS: &[&str] = &["time", "prevValue"];
const POST_PARAMS: &[&str] = &["time", "value", "prevValue", "timePrev", "prevOrigValue"];

/// Loaded into every interpreter before the user body. Reading an undefined
/// global raises instead of yielding `nil`.
const PRELUDE: &str = r#"
Math = {
    PI = math.pi,
    E = math.exp(1),
    abs = math.abs,
    ceil = math.ceil,
    floor = math.floor,
    sqrt = math.sqrt,
    sin = math.sin,
    cos = math.cos,
    tan = math.tan,
    asin = math.asin,
    acos = math.acos,
    atan = math.atan,
    exp = math.exp,
    log = math.log,
    min = math.min,
    max = math.max,
    random = math.random,
    pow = function(base, exponent) return base ^ exponent end,
    round = function(x) return math.floor(x + 0.5) end,
}
setmetatable(_G, {
    __index = function(_, name)
        error("unknown identifier '" .. tostring(name) .. "'", 2)
    end,
})
"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionCompiler;

impl ExpressionCompiler {
    pub fn new() -> Self {
        Self
    }

    fn compile(&self, body: &str, params: &[&str]) -> Result<CompiledScript, ScriptError> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE,
            LuaOptions::default(),
        )
        .map_err(compile_error)?;
        lua.load(PRELUDE)
            .set_name("=prelude")
            .exec()
            .map_err(compile_error)?;

        let params = params.join(", ");
        let expression = format!("return function({}) return {}\nend", params, body);
        let func = match lua.load(expression.as_str()).set_name("=script").eval::<Function>() {
            Ok(func) => func,
            Err(_) => {
                let block = format!("return function({})\n{}\nend", params, body);
                lua.load(block.as_str())
                    .set_name("=script")
                    .eval::<Function>()
                    .map_err(compile_error)?
            }
        };
        Ok(CompiledScript { func, lua })
    }
}

#[async_trait]
impl ScriptCompiler for ExpressionCompiler {
    async fn compile_value_function(&self, body: &str) -> Result<ValueFunction, ScriptError> {
        let script = self.compile(body, VALUE_PARAMS)?;
        Ok(Arc::new(move |time: i64, prev_value: &Value| {
            script.call(&[&Value::from(time), prev_value])
        }))
    }

    async fn compile_post_function(&self, body: &str) -> Result<PostFunction, ScriptError> {
        let script = self.compile(body, POST_PARAMS)?;
        Ok(Arc::new(move |args: &PostArgs<'_>| {
            script.call(&[
                &Value::from(args.time),
                args.value,
                args.prev_value,
                &Value::from(args.time_prev),
                args.prev_orig_value,
            ])
        }))
    }
}

/// A compiled body together with the interpreter that owns it. `func` is
/// declared first so it is dropped before its interpreter.
struct CompiledScript {
    func: Function,
    lua: Lua,
}

impl CompiledScript {
    fn call(&self, args: &[&Value]) -> Result<Value, ScriptError> {
        let args = args
            .iter()
            .map(|value| to_lua(&self.lua, value))
            .collect::<mlua::Result<MultiValue>>()
            .map_err(runtime_error)?;
        let result = self.func.call::<LuaValue>(args).map_err(runtime_error)?;
        from_lua(&self.lua, result)
    }
}

fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(flag) => LuaValue::Boolean(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => LuaValue::Integer(integer),
            None => LuaValue::Number(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => LuaValue::String(lua.create_string(text)?),
        nested => lua.to_value(nested)?,
    })
}

/// Integral floats come back as JSON integers. Non-finite numbers have no
/// JSON form and fail the call.
fn from_lua(lua: &Lua, value: LuaValue) -> Result<Value, ScriptError> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(flag) => Ok(Value::Bool(flag)),
        LuaValue::Integer(integer) => Ok(Value::from(integer)),
        LuaValue::Number(number) if number.is_finite() => Ok(number_value(number)),
        LuaValue::Number(number) => Err(ScriptError::Runtime(format!(
            "function produced non-finite result {}",
            number
        ))),
        LuaValue::String(text) => {
            let text: &str = &text.to_str().map_err(runtime_error)?;
            Ok(Value::String(text.to_string()))
        }
        table @ LuaValue::Table(_) => lua.from_value(table).map_err(runtime_error),
        other => Err(ScriptError::Runtime(format!(
            "unsupported result type {}",
            other.type_name()
        ))),
    }
}

fn compile_error(err: mlua::Error) -> ScriptError {
    match err {
        mlua::Error::SyntaxError { message, .. } => ScriptError::Compile(message),
        other => ScriptError::Compile(other.to_string()),
    }
}

fn runtime_error(err: mlua::Error) -> ScriptError {
    ScriptError::Runtime(err.to_string())
}
