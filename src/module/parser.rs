//! 模块描述文件解析器
//!
//! 负责从 module.yaml 解析模块描述，并转换为描述字典。

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::module::metadata::{
    ModuleManifest, MODULE_ACTIVATOR, MODULE_DESCRIPTION, MODULE_NAME, MODULE_REQUIRES,
    MODULE_SYMBOLIC_NAME, MODULE_VERSION,
};
use crate::service::properties::{PropertyDictionary, Value};
use crate::utils::Result;

/// 描述文件名
pub const MANIFEST_FILE: &str = "module.yaml";

/// module.yaml 中的依赖声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequireEntry {
    /// 依赖模块符号名
    pub name: String,

    /// 版本要求，缺省为 `*`
    #[serde(default)]
    pub version: Option<String>,
}

/// module.yaml 文件结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub symbolic_name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activator: Option<String>,

    #[serde(default)]
    pub requires: Vec<RequireEntry>,

    /// 自定义描述键
    #[serde(default)]
    pub properties: IndexMap<String, Value>,
}

impl ModuleDescriptor {
    /// 转换为描述字典
    pub fn to_dictionary(&self) -> PropertyDictionary {
        let mut dict: PropertyDictionary = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        dict.insert(MODULE_SYMBOLIC_NAME, self.symbolic_name.as_str());
        dict.insert(MODULE_VERSION, self.version.as_str());
        if let Some(name) = &self.name {
            dict.insert(MODULE_NAME, name.as_str());
        }
        if let Some(description) = &self.description {
            dict.insert(MODULE_DESCRIPTION, description.as_str());
        }
        if let Some(activator) = &self.activator {
            dict.insert(MODULE_ACTIVATOR, activator.as_str());
        }
        if !self.requires.is_empty() {
            let requires: Vec<String> = self
                .requires
                .iter()
                .map(|r| match &r.version {
                    Some(v) => format!("{} {}", r.name, v),
                    None => r.name.clone(),
                })
                .collect();
            dict.insert(MODULE_REQUIRES, requires);
        }
        dict
    }
}

/// 模块描述文件解析器
#[derive(Debug, Clone, Default)]
pub struct ModuleParser;

impl ModuleParser {
    /// 创建新的解析器实例
    pub fn new() -> Self {
        Self
    }

    /// 从文件解析模块描述
    ///
    /// # Errors
    ///
    /// - 文件不存在或无法读取时返回 IO 错误
    /// - 文件内容不符合 YAML 格式时返回 YAML 错误
    pub async fn parse_file(path: &Path) -> Result<ModuleDescriptor> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_string(&content)
    }

    /// 从文件同步解析模块描述
    pub fn parse_file_sync(path: &Path) -> Result<ModuleDescriptor> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_string(&content)
    }

    /// 从字符串解析模块描述
    pub fn parse_string(content: &str) -> Result<ModuleDescriptor> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// 解析并校验，得到完整的模块描述
    ///
    /// # Arguments
    ///
    /// * `location` - 用于错误信息的来源
    /// * `content` - YAML 文本
    pub fn parse_manifest(location: &str, content: &str) -> Result<ModuleManifest> {
        let descriptor = Self::parse_string(content)?;
        ModuleManifest::from_dictionary(location, &descriptor.to_dictionary())
    }
}
