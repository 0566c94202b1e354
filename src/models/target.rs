use crate::utils::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 任务目标数据库
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    /// 实例 ID
    pub instance_id: i64,
    /// 数据库名称
    pub database_name: String,
    /// 实例名称
    #[serde(default)]
    pub instance_name: String,
}

impl TargetDescriptor {
    /// 去重键：同一实例上的同名数据库视为同一目标
    pub fn key(&self) -> (i64, &str) {
        (self.instance_id, self.database_name.as_str())
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.instance_name.is_empty() {
            write!(f, "#{}/{}", self.instance_id, self.database_name)
        } else {
            write!(f, "{}(#{})/{}", self.instance_name, self.instance_id, self.database_name)
        }
    }
}

/// 任务目标数据库列表，持久化为 JSON 数组文本
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct TaskDatabases(Vec<TargetDescriptor>);

impl TaskDatabases {
    /// 构造并校验：不允许重复目标
    pub fn new(targets: Vec<TargetDescriptor>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(targets.len());
        for target in &targets {
            if target.database_name.trim().is_empty() {
                return Err(AppError::InvalidInput(format!(
                    "Target on instance {} has an empty database name",
                    target.instance_id
                )));
            }
            if !seen.insert(target.key()) {
                return Err(AppError::InvalidInput(format!(
                    "Duplicate target database: {}",
                    target
                )));
            }
        }
        Ok(Self(targets))
    }

    pub fn as_slice(&self) -> &[TargetDescriptor] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetDescriptor> {
        self.0.iter()
    }

    /// 编码为持久化文本
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// 从持久化文本解码。解析失败或内容非法时返回 `CorruptTaskData`，
    /// 不会退化为空列表。
    pub fn decode(task_id: i64, raw: &str) -> Result<Self> {
        let targets: Vec<TargetDescriptor> =
            serde_json::from_str(raw).map_err(|e| AppError::CorruptTaskData {
                task_id,
                reason: format!("databases column is not a valid target list: {}", e),
            })?;

        Self::new(targets).map_err(|e| AppError::CorruptTaskData {
            task_id,
            reason: e.to_string(),
        })
    }
}

impl<'a> IntoIterator for &'a TaskDatabases {
    type Item = &'a TargetDescriptor;
    type IntoIter = std::slice::Iter<'a, TargetDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// 待执行的 SQL 语句
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Statement {
    /// 执行顺序，从 0 开始
    pub position: u32,
    pub sql: String,
}

impl Statement {
    /// 由原始 SQL 列表构造有序语句集合
    pub fn from_texts<I, S>(texts: I) -> Result<Vec<Statement>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut statements = Vec::new();
        for (position, text) in texts.into_iter().enumerate() {
            let sql: String = text.into();
            let sql = sql.trim().to_string();
            if sql.is_empty() {
                return Err(AppError::InvalidInput(format!(
                    "Statement #{} is empty",
                    position + 1
                )));
            }
            statements.push(Statement {
                position: position as u32,
                sql,
            });
        }
        Ok(statements)
    }
}
