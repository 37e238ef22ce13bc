//! Fragment shaders loaded from `.frag` / `.glsl` files.
//!
//! Comment directives describe the unit:
//!
//! ```text
//! // @name: tunnel
//! // @param speed float 0.1 5.0 1.0 Scroll speed
//! // @param rings int 1 32 8 Ring count
//! // @param mirror bool true Mirror horizontally
//! ```
//!
//! Each parameter is bound as a `u_<key>` uniform on every draw.

use std::borrow::Cow;
use std::path::Path;

use crate::unit::{FrameInput, SchemaField, ShaderEffect};
use crate::{ConfigMap, Result, UniformValue, VisualError};

const NAME_DIRECTIVE: &str = "@name:";
const PARAM_DIRECTIVE: &str = "@param";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    Float { min: f64, max: f64 },
    Int { min: i64, max: i64 },
    Bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderParam {
    pub key: String,
    pub kind: ParamKind,
    pub default: f64,
    pub label: String,
}

impl ShaderParam {
    fn schema(&self) -> SchemaField {
        match self.kind {
            ParamKind::Float { min, max } => SchemaField::float(&self.key, &self.label, min, max, self.default),
            ParamKind::Int { min, max } => {
                SchemaField::int(&self.key, &self.label, min, max, self.default as i64)
            }
            ParamKind::Bool => SchemaField::bool(&self.key, &self.label, self.default != 0.0),
        }
    }

    fn uniform(&self, value: f64) -> UniformValue {
        match self.kind {
            ParamKind::Float { .. } => UniformValue::Float(value as f32),
            ParamKind::Int { .. } | ParamKind::Bool => UniformValue::Int(value as i32),
        }
    }

    /// Reads this parameter from `config`, clamped to its range. `None` for
    /// a missing key or a value of the wrong type.
    fn read(&self, config: &ConfigMap) -> Option<f64> {
        let value = config.get(&self.key)?;
        match self.kind {
            ParamKind::Float { min, max } => value
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| v.clamp(min, max)),
            ParamKind::Int { min, max } => value.as_i64().map(|v| v.clamp(min, max) as f64),
            ParamKind::Bool => value.as_bool().map(|v| if v { 1.0 } else { 0.0 }),
        }
    }
}

/// Parsed contents of a shader file.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderFile {
    pub name: Option<String>,
    pub params: Vec<ShaderParam>,
    pub source: String,
}

impl ShaderFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| VisualError::load(path, err.to_string()))?;
        Self::parse(&text).map_err(|err| VisualError::load(path, err.to_string()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(VisualError::msg("empty shader source"));
        }

        let mut name = None;
        let mut params: Vec<ShaderParam> = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let Some(comment) = line.trim_start().strip_prefix("//") else {
                continue;
            };
            let comment = comment.trim();

            if let Some(value) = comment.strip_prefix(NAME_DIRECTIVE) {
                let value = value.trim();
                if !value.is_empty() {
                    name = Some(value.to_string());
                }
            } else if let Some(rest) = comment.strip_prefix(PARAM_DIRECTIVE) {
                let param = parse_param(rest)
                    .map_err(|reason| VisualError::msg(format!("line {}: {reason}", index + 1)))?;
                if params.iter().any(|known| known.key == param.key) {
                    return Err(VisualError::msg(format!(
                        "line {}: duplicate parameter `{}`",
                        index + 1,
                        param.key
                    )));
                }
                params.push(param);
            }
        }

        Ok(Self {
            name,
            params,
            source: text.to_string(),
        })
    }
}

fn parse_param(rest: &str) -> std::result::Result<ShaderParam, String> {
    let mut fields = rest.split_whitespace();
    let key = fields.next().ok_or("missing parameter key")?;
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("`{key}` is not a valid uniform suffix"));
    }
    let kind = fields.next().ok_or("missing parameter type")?;

    let number = |field: Option<&str>, what: &str| -> std::result::Result<f64, String> {
        let text = field.ok_or_else(|| format!("missing {what}"))?;
        text.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("invalid {what} `{text}`"))
    };

    let (kind, default) = match kind {
        "float" => {
            let min = number(fields.next(), "minimum")?;
            let max = number(fields.next(), "maximum")?;
            let default = number(fields.next(), "default")?;
            (ParamKind::Float { min, max }, default)
        }
        "int" => {
            let min = number(fields.next(), "minimum")? as i64;
            let max = number(fields.next(), "maximum")? as i64;
            let default = number(fields.next(), "default")?.round();
            (ParamKind::Int { min, max }, default)
        }
        "bool" => {
            let default = match fields.next() {
                Some("true" | "1") => 1.0,
                Some("false" | "0") => 0.0,
                Some(other) => return Err(format!("invalid default `{other}`")),
                None => return Err("missing default".to_string()),
            };
            (ParamKind::Bool, default)
        }
        other => return Err(format!("unsupported parameter type `{other}`")),
    };

    let default = match kind {
        ParamKind::Float { min, max } if min > max => return Err("minimum exceeds maximum".to_string()),
        ParamKind::Int { min, max } if min > max => return Err("minimum exceeds maximum".to_string()),
        ParamKind::Float { min, max } => default.clamp(min, max),
        ParamKind::Int { min, max } => default.clamp(min as f64, max as f64),
        ParamKind::Bool => default,
    };

    let label = fields.collect::<Vec<_>>().join(" ");
    Ok(ShaderParam {
        key: key.to_string(),
        label: if label.is_empty() { key.to_string() } else { label },
        kind,
        default,
    })
}

/// [`ShaderEffect`] over a parsed file, holding the current parameter values.
#[derive(Debug, Clone)]
pub struct ShaderFileEffect {
    file: ShaderFile,
    values: Vec<f64>,
}

impl ShaderFileEffect {
    pub fn new(file: ShaderFile) -> Self {
        let values = file.params.iter().map(|param| param.default).collect();
        Self { file, values }
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.file
            .params
            .iter()
            .position(|param| param.key == key)
            .map(|index| self.values[index])
    }
}

impl ShaderEffect for ShaderFileEffect {
    fn fragment_source(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.file.source)
    }

    fn configure(&mut self, config: &ConfigMap) {
        for (param, value) in self.file.params.iter().zip(self.values.iter_mut()) {
            if let Some(next) = param.read(config) {
                *value = next;
            }
        }
    }

    fn schema(&self) -> Vec<SchemaField> {
        self.file.params.iter().map(ShaderParam::schema).collect()
    }

    fn uniforms(&self, _frame: &FrameInput, out: &mut Vec<(String, UniformValue)>) {
        for (param, value) in self.file.params.iter().zip(&self.values) {
            out.push((format!("u_{}", param.key), param.uniform(*value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::AudioSnapshot;

    const TUNNEL: &str = "\
// @name: tunnel
// @param speed float 0.1 5.0 1.0 Scroll speed
// @param rings int 1 32 8
// @param mirror bool true Mirror horizontally
uniform float u_speed;
void main() {}
";

    #[test]
    fn directives_declare_name_and_schema() {
        let file = ShaderFile::parse(TUNNEL).unwrap();
        assert_eq!(file.name.as_deref(), Some("tunnel"));
        assert_eq!(file.params.len(), 3);
        assert_eq!(file.params[1].label, "rings");

        let schema = ShaderFileEffect::new(file).schema();
        assert_eq!(schema[0], SchemaField::float("speed", "Scroll speed", 0.1, 5.0, 1.0));
        assert_eq!(schema[2], SchemaField::bool("mirror", "Mirror horizontally", true));
    }

    #[test]
    fn configure_clamps_and_ignores_bad_values() {
        let mut effect = ShaderFileEffect::new(ShaderFile::parse(TUNNEL).unwrap());
        effect.configure(json!({ "speed": 99.0, "rings": "many", "mirror": false, "other": 1 }).as_object().unwrap());

        assert_eq!(effect.value("speed"), Some(5.0));
        assert_eq!(effect.value("rings"), Some(8.0));
        assert_eq!(effect.value("mirror"), Some(0.0));

        let frame = FrameInput {
            width: 1,
            height: 1,
            phase: 0.0,
            audio: AudioSnapshot::SILENT,
        };
        let mut uniforms = Vec::new();
        effect.uniforms(&frame, &mut uniforms);
        assert_eq!(uniforms[0], ("u_speed".to_string(), UniformValue::Float(5.0)));
        assert_eq!(uniforms[2], ("u_mirror".to_string(), UniformValue::Int(0)));
    }

    #[test]
    fn malformed_directives_are_rejected() {
        for text in [
            "",
            "// @param speed float 1 0 0.5\nvoid main() {}",
            "// @param speed vec9 0 1 0\nvoid main() {}",
            "// @param bad-key float 0 1 0\nvoid main() {}",
            "// @param a float 0 1 0\n// @param a int 0 1 0\nvoid main() {}",
            "// @param flag bool maybe\nvoid main() {}",
        ] {
            assert!(ShaderFile::parse(text).is_err(), "accepted {text:?}");
        }
    }

    #[test]
    fn files_without_directives_are_plain_shaders() {
        let file = ShaderFile::parse("void main() {}").unwrap();
        assert!(file.name.is_none());
        assert!(file.params.is_empty());
    }
}
