/// Embedded Lua execution for script-backed local functions
///
/// The merged task input is exposed as the global `input` table; the script's
/// return value must be a table and becomes the task output.

use crate::workflow::types::Payload;
use anyhow::Result;
use mlua::LuaSerdeExt;
use serde_json::Value;

/// Run `script` against `input` in a fresh sandboxed Lua state
pub fn run_script(script: &str, input: &Payload) -> Result<Payload> {
    // New Lua instance per call; nothing is shared between tasks
    let lua = mlua::Lua::new();
    let globals = lua.globals();

    // Remove dangerous globals (ignore errors)
    for name in ["os", "io", "debug", "package", "require", "dofile", "loadfile"] {
        let _ = globals.set(name, mlua::Nil);
    }

    let input_table = lua
        .to_value(input)
        .map_err(|e| anyhow::anyhow!("Failed to convert task input to Lua: {}", e))?;
    globals
        .set("input", input_table)
        .map_err(|e| anyhow::anyhow!("Failed to set Lua input: {}", e))?;

    tracing::debug!("🏃 Executing Lua function");
    let result: mlua::Value = lua
        .load(script)
        .eval()
        .map_err(|e| anyhow::anyhow!("Lua script execution failed: {}", e))?;

    match lua_to_json(result)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow::anyhow!("Lua script must return a table with named keys, got {}", other)),
    }
}

/// Convert Lua value to JSON Value
///
/// Tables with contiguous positive integer keys become arrays, all other
/// tables (including empty ones) become objects.
fn lua_to_json(lua_value: mlua::Value) -> Result<Value> {
    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        mlua::Value::String(s) => {
            let s_str = s.to_str().map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua string: {}", e))?;
            Ok(Value::String(s_str.to_string()))
        }
        mlua::Value::Table(table) => {
            let mut is_array = true;
            let mut max_index = 0;
            let mut count = 0;

            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut arr = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    let val = table.get(i).map_err(|e| anyhow::anyhow!("Failed to get Lua table value: {}", e))?;
                    arr.push(lua_to_json(val)?);
                }
                Ok(Value::Array(arr))
            } else {
                let mut obj = serde_json::Map::new();
                for pair in table.pairs::<mlua::Value, mlua::Value>() {
                    let (key, value) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                    let key_str = match key {
                        mlua::Value::String(s) => s
                            .to_str()
                            .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua key: {}", e))?
                            .to_string(),
                        mlua::Value::Integer(i) => i.to_string(),
                        mlua::Value::Number(f) => f.to_string(),
                        _ => continue,
                    };
                    obj.insert(key_str, lua_to_json(value)?);
                }
                Ok(Value::Object(obj))
            }
        }
        // null sentinel from serde conversion, functions, userdata
        _ => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::payload;
    use serde_json::json;

    #[test]
    fn script_reads_input_and_returns_table() {
        let input = payload(json!({"score": 21, "name": "ligand-1"}));
        let output = run_script("return { doubled = input.score * 2, label = input.name }", &input).unwrap();
        assert_eq!(output, payload(json!({"doubled": 42, "label": "ligand-1"})));
    }

    #[test]
    fn arrays_round_trip_through_lua() {
        let input = payload(json!({"values": [1, 2, 3]}));
        let output = run_script(
            "local out = {} for i, v in ipairs(input.values) do out[i] = v * 10 end return { values = out }",
            &input,
        )
        .unwrap();
        assert_eq!(output["values"], json!([10, 20, 30]));
    }

    #[test]
    fn non_table_result_is_an_error() {
        assert!(run_script("return 5", &Payload::new()).is_err());
        assert!(run_script("return {1, 2}", &Payload::new()).is_err());
    }

    #[test]
    fn sandbox_hides_os() {
        assert!(run_script("return { t = os.time() }", &Payload::new()).is_err());
    }
}
