//! 属性字典
//!
//! 服务属性与模块描述都使用 [`PropertyDictionary`] 表示：一个保持插入顺序、
//! 键名大小写不敏感的映射，值为 [`Value`] 标签联合。

use std::fmt;

use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// 接口名称列表的保留键
pub const OBJECT_CLASS: &str = "objectClass";

/// 服务标识的保留键
pub const SERVICE_ID: &str = "service.id";

/// 服务排序权重的保留键
pub const SERVICE_RANKING: &str = "service.ranking";

/// 属性值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// 布尔值
    Bool(bool),
    /// 数值
    Number(f64),
    /// 字符串
    String(String),
    /// 字符串列表
    StringList(Vec<String>),
}

impl Value {
    /// 作为字符串读取
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// 作为数值读取
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// 作为布尔值读取
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 作为字符串列表读取
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Value::StringList(list) => Some(list),
            _ => None,
        }
    }

    /// 类型名称（用于日志）
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::StringList(_) => "string_list",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
            Value::StringList(list) => write!(f, "[{}]", list.join(", ")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<Vec<String>> for Value {
    fn from(list: Vec<String>) -> Self {
        Value::StringList(list)
    }
}

impl From<Vec<&str>> for Value {
    fn from(list: Vec<&str>) -> Self {
        Value::StringList(list.into_iter().map(str::to_string).collect())
    }
}

/// 属性字典
///
/// 键在大小写不敏感比较下唯一；以不同大小写再次插入同一个键会覆盖原值，
/// 位置保持不变，键名拼写更新为最近一次插入的写法。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDictionary {
    /// 小写键 -> (原始键名, 值)
    entries: IndexMap<String, (String, Value)>,
}

impl PropertyDictionary {
    /// 创建空字典
    pub fn new() -> Self {
        Self::default()
    }

    /// 构建器风格插入
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// 插入属性，返回被覆盖的旧值
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let folded = key.to_lowercase();
        match self.entries.get_mut(&folded) {
            Some(slot) => {
                let old = std::mem::replace(slot, (key, value.into()));
                Some(old.1)
            }
            None => {
                self.entries.insert(folded, (key, value.into()));
                None
            }
        }
    }

    /// 按键读取（大小写不敏感）
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&key.to_lowercase()).map(|(_, v)| v)
    }

    /// 是否包含键
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    /// 移除键，保持其余键的顺序
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(&key.to_lowercase()).map(|(_, v)| v)
    }

    /// 属性数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按插入顺序遍历（原始键名）
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }

    /// 按插入顺序返回键名
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(k, _)| k.as_str())
    }

    /// 合并另一个字典，同名键被覆盖
    pub fn extend(&mut self, other: PropertyDictionary) {
        for (_, (key, value)) in other.entries {
            self.insert(key, value);
        }
    }

    /// 读取字符串属性
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// 读取 `objectClass` 接口列表
    pub fn object_class(&self) -> &[String] {
        self.get(OBJECT_CLASS)
            .and_then(Value::as_string_list)
            .unwrap_or(&[])
    }

    /// 读取服务排序权重，缺失或非数值时为 0
    pub fn ranking(&self) -> f64 {
        self.get(SERVICE_RANKING)
            .and_then(Value::as_f64)
            .filter(|n| n.is_finite())
            .unwrap_or(0.0)
    }
}

impl<K, V> FromIterator<(K, V)> for PropertyDictionary
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = PropertyDictionary::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

impl Serialize for PropertyDictionary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PropertyDictionary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = IndexMap::<String, Value>::deserialize(deserializer)?;
        Ok(raw.into_iter().collect())
    }
}
