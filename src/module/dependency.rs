//! 模块依赖管理
//!
//! 本模块提供模块连线关系的图结构和解析器。
//!
//! # 主要组件
//!
//! - [`DependencyGraph`] - 已解析模块之间的连线图
//! - [`DependencyResolver`] - 依赖解析器，为目标模块计算完整的解析计划
//!
//! # 示例
//!
//! ```rust
//! use chips_runtime::module::dependency::DependencyGraph;
//! use chips_runtime::utils::id::ModuleId;
//!
//! let (a, b) = (ModuleId::new(1), ModuleId::new(2));
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency(a, b);
//!
//! assert_eq!(graph.dependencies(a), vec![b]);
//! assert!(graph.find_cycle().is_none());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use semver::Version;

use crate::module::metadata::{ModuleRecord, Requirement};
use crate::utils::id::ModuleId;
use crate::utils::{CoreError, Result};

/// 模块连线图
///
/// 边 `a -> b` 表示模块 `a` 的某个依赖连到了模块 `b`。
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 正向边：模块 -> 它依赖的模块
    edges: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
    /// 反向边：模块 -> 依赖它的模块
    reverse_edges: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
}

impl DependencyGraph {
    /// 创建一个空的依赖图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块节点，已存在时不变
    pub fn add_module(&mut self, module: ModuleId) {
        self.edges.entry(module).or_default();
        self.reverse_edges.entry(module).or_default();
    }

    /// 添加依赖关系
    ///
    /// 表示 `module` 依赖于 `provider`，两端节点不存在时自动添加。
    pub fn add_dependency(&mut self, module: ModuleId, provider: ModuleId) {
        self.add_module(module);
        self.add_module(provider);
        self.edges.entry(module).or_default().insert(provider);
        self.reverse_edges.entry(provider).or_default().insert(module);
    }

    /// 移除模块及其所有边
    pub fn remove_module(&mut self, module: ModuleId) {
        if let Some(deps) = self.edges.remove(&module) {
            for dep in deps {
                if let Some(rev) = self.reverse_edges.get_mut(&dep) {
                    rev.remove(&module);
                }
            }
        }
        if let Some(dependents) = self.reverse_edges.remove(&module) {
            for dependent in dependents {
                if let Some(deps) = self.edges.get_mut(&dependent) {
                    deps.remove(&module);
                }
            }
        }
    }

    /// 直接依赖
    pub fn dependencies(&self, module: ModuleId) -> Vec<ModuleId> {
        self.edges
            .get(&module)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 直接依赖方
    pub fn dependents(&self, module: ModuleId) -> Vec<ModuleId> {
        self.reverse_edges
            .get(&module)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 查找循环依赖路径
    ///
    /// # 返回
    ///
    /// 存在循环时返回闭合路径（首尾相同），否则返回 `None`
    pub fn find_cycle(&self) -> Option<Vec<ModuleId>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        self.edges
            .keys()
            .find_map(|&node| self.find_cycle_util(node, &mut visited, &mut path))
    }

    fn find_cycle_util(
        &self,
        node: ModuleId,
        visited: &mut HashSet<ModuleId>,
        path: &mut Vec<ModuleId>,
    ) -> Option<Vec<ModuleId>> {
        if let Some(start) = path.iter().position(|&n| n == node) {
            let mut cycle = path[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }

        path.push(node);
        if let Some(neighbors) = self.edges.get(&node) {
            for &neighbor in neighbors {
                if let Some(cycle) = self.find_cycle_util(neighbor, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }

    /// 拓扑排序（Kahn 算法）
    ///
    /// 依赖排在依赖方之前；同一层按模块 ID 升序。
    ///
    /// # 错误
    ///
    /// 存在循环依赖时返回 `CoreError::CircularDependency`。
    pub fn topological_sort(&self) -> Result<Vec<ModuleId>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(CoreError::CircularDependency(join_ids(&cycle)));
        }

        // 入度 = 尚未排出的依赖数
        let mut in_degree: BTreeMap<ModuleId, usize> = self
            .edges
            .iter()
            .map(|(node, deps)| (*node, deps.len()))
            .collect();

        let mut queue: VecDeque<ModuleId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for dependent in self.dependents(node) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        Ok(order)
    }
}

fn join_ids(ids: &[ModuleId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

// ==================== 依赖解析 ====================

/// 参与解析的候选模块
#[derive(Debug, Clone)]
pub struct ResolveCandidate {
    pub id: ModuleId,
    pub symbolic_name: String,
    pub version: Version,
    pub requires: Vec<Requirement>,
    /// 已解析的模块不再展开
    pub resolved: bool,
}

impl From<&ModuleRecord> for ResolveCandidate {
    fn from(record: &ModuleRecord) -> Self {
        Self {
            id: record.id,
            symbolic_name: record.manifest.symbolic_name.clone(),
            version: record.manifest.version.clone(),
            requires: record.manifest.requires.clone(),
            resolved: record.state.is_resolved(),
        }
    }
}

/// 解析计划中的一步：把一个模块的依赖连到提供方
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveStep {
    pub module: ModuleId,
    pub wires: Vec<(Requirement, ModuleId)>,
}

/// 依赖解析器
///
/// 在某一时刻的模块快照上为目标模块计算解析计划，不修改任何状态。
pub struct DependencyResolver<'a> {
    candidates: &'a [ResolveCandidate],
}

impl<'a> DependencyResolver<'a> {
    /// 在候选集合上创建解析器
    pub fn new(candidates: &'a [ResolveCandidate]) -> Self {
        Self { candidates }
    }

    /// 为依赖选择提供方
    ///
    /// 优先已解析的模块，其次版本最高，最后模块 ID 最小。
    pub fn select(&self, requirement: &Requirement) -> Option<&'a ResolveCandidate> {
        self.candidates
            .iter()
            .filter(|c| requirement.matches(&c.symbolic_name, &c.version))
            .min_by(|a, b| {
                b.resolved
                    .cmp(&a.resolved)
                    .then_with(|| b.version.cmp(&a.version))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    /// 计算解析计划
    ///
    /// # 返回
    ///
    /// 需要迁移到 Resolved 的模块，依赖在前；目标已解析时为空
    ///
    /// # 错误
    ///
    /// - 任一依赖找不到提供方时返回 `UnresolvedDependency`
    /// - 依赖链成环时返回 `CircularDependency`
    pub fn plan(&self, root: ModuleId) -> Result<Vec<ResolveStep>> {
        let mut visiting = Vec::new();
        let mut done = HashSet::new();
        let mut steps = Vec::new();
        self.visit(root, &mut visiting, &mut done, &mut steps)?;
        Ok(steps)
    }

    fn candidate(&self, id: ModuleId) -> Result<&'a ResolveCandidate> {
        self.candidates
            .iter()
            .find(|c| c.id == id)
            .ok_or(CoreError::ModuleNotFound(id))
    }

    fn visit(
        &self,
        id: ModuleId,
        visiting: &mut Vec<ModuleId>,
        done: &mut HashSet<ModuleId>,
        steps: &mut Vec<ResolveStep>,
    ) -> Result<()> {
        if done.contains(&id) {
            return Ok(());
        }
        if let Some(start) = visiting.iter().position(|&v| v == id) {
            let mut names: Vec<String> = visiting[start..]
                .iter()
                .filter_map(|&v| self.candidate(v).ok())
                .map(|c| c.symbolic_name.clone())
                .collect();
            names.push(self.candidate(id)?.symbolic_name.clone());
            return Err(CoreError::CircularDependency(names.join(" -> ")));
        }

        let candidate = self.candidate(id)?;
        if candidate.resolved {
            done.insert(id);
            return Ok(());
        }

        let mut wires = Vec::with_capacity(candidate.requires.len());
        let mut missing = Vec::new();
        for requirement in &candidate.requires {
            match self.select(requirement) {
                Some(provider) => wires.push((requirement.clone(), provider.id)),
                None => missing.push(requirement.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(CoreError::UnresolvedDependency {
                module: candidate.symbolic_name.clone(),
                missing,
            });
        }

        visiting.push(id);
        for (_, provider) in &wires {
            self.visit(*provider, visiting, done, steps)?;
        }
        visiting.pop();

        done.insert(id);
        steps.push(ResolveStep { module: id, wires });
        Ok(())
    }
}
