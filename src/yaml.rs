use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::{self, Deserialize, Deserializer, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor};
use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Number, Value};

use crate::paths::write_file_atomic;

pub fn load_yaml(path: &Path) -> Result<Value> {
    let content =
        fs::read_to_string(path).with_context(|| format!("读取 YAML 失败: {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("解析 YAML 失败: {}", path.display()))
}

pub fn save_yaml(path: &Path, root: &Value) -> Result<()> {
    let text = serde_yaml::to_string(root).context("序列化 YAML 失败")?;
    write_file_atomic(path, &text)
}

/// 宽松解析：重复 key 以后出现者为准，并展开 `<<` 合并键。
pub fn parse_lenient(content: &str) -> Result<Value> {
    let LenientValue(mut value) =
        serde_yaml::from_str(content).context("解析 YAML 失败")?;
    value.apply_merge().context("展开 YAML 合并键失败")?;
    Ok(value)
}

struct LenientValue(Value);

impl<'de> Deserialize<'de> for LenientValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(LenientVisitor)
    }
}

struct LenientVisitor;

impl<'de> Visitor<'de> for LenientVisitor {
    type Value = LenientValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any YAML value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<LenientValue, E> {
        Ok(LenientValue(Value::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<LenientValue, E> {
        Ok(LenientValue(Value::Number(Number::from(v))))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<LenientValue, E> {
        Ok(LenientValue(Value::Number(Number::from(v))))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<LenientValue, E> {
        Ok(LenientValue(Value::Number(Number::from(v))))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<LenientValue, E> {
        Ok(LenientValue(Value::String(v.to_string())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<LenientValue, E> {
        Ok(LenientValue(Value::String(v)))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<LenientValue, E> {
        Ok(LenientValue(Value::Null))
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<LenientValue, E> {
        Ok(LenientValue(Value::Null))
    }

    fn visit_some<D>(self, deserializer: D) -> std::result::Result<LenientValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        LenientValue::deserialize(deserializer)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<LenientValue, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(LenientValue(item)) = seq.next_element()? {
            items.push(item);
        }
        Ok(LenientValue(Value::Sequence(items)))
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<LenientValue, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut mapping = Mapping::new();
        while let Some((LenientValue(key), LenientValue(value))) = map.next_entry()? {
            mapping.insert(key, value);
        }
        Ok(LenientValue(Value::Mapping(mapping)))
    }

    fn visit_enum<A>(self, data: A) -> std::result::Result<LenientValue, A::Error>
    where
        A: EnumAccess<'de>,
    {
        let (tag, variant): (String, _) = data.variant()?;
        let LenientValue(value) = variant.newtype_variant()?;
        Ok(LenientValue(Value::Tagged(Box::new(TaggedValue {
            tag: Tag::new(tag),
            value,
        }))))
    }
}

/// 对象逐 key 递归合并；数组和标量整体替换。
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Mapping(base_map), Value::Mapping(patch_map)) => {
            for (k, v) in patch_map {
                match base_map.get_mut(k) {
                    Some(base_val) => deep_merge(base_val, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base_val, patch_val) => {
            *base_val = patch_val.clone();
        }
    }
}

pub fn key_exists(root: &Value, key: &str) -> bool {
    root.as_mapping()
        .map(|m| m.contains_key(key))
        .unwrap_or(false)
}

pub fn ensure_mapping(value: &mut Value) -> &mut Mapping {
    if !value.is_mapping() {
        *value = Value::Mapping(Mapping::new());
    }
    match value {
        Value::Mapping(map) => map,
        _ => unreachable!("value was just replaced with a mapping"),
    }
}

/// 按点号路径构造嵌套对象，例如 `dns.enable` + `false`。
pub fn nested_assignment(path: &str, value: Value) -> Option<Value> {
    let keys: Vec<&str> = path.split('.').map(str::trim).collect();
    if keys.iter().any(|k| k.is_empty()) {
        return None;
    }
    let mut current = value;
    for key in keys.iter().rev() {
        let mut map = Mapping::new();
        map.insert(Value::String((*key).to_string()), current);
        current = Value::Mapping(map);
    }
    Some(current)
}
