//! Community detection: multi-level Louvain modularity optimization.
//!
//! Detection runs over [`UndirectedProjection`], so edge direction and parallel relationships
//! do not influence the partition. Every input node receives exactly one community id;
//! isolated nodes end up in singleton communities.
//!
//! The pass is fully deterministic: nodes are visited in document order, candidate
//! communities in ascending index order, and a node only moves on a strictly better gain.
//! Final community ids are renumbered `"0"`, `"1"`, ... by first appearance in document order.

use crate::{
    error::StoryError,
    graph::{GraphDocument, UndirectedProjection},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node id -> community id.
pub type CommunityMap = BTreeMap<String, String>;

const GAIN_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LouvainConfig {
    /// Modularity resolution (gamma). Higher values favour smaller communities.
    pub resolution: f64,
    /// Upper bound on local-moving sweeps per level.
    pub max_passes: usize,
    /// Upper bound on aggregation levels.
    pub max_levels: usize,
}

impl Default for LouvainConfig {
    fn default() -> Self {
        LouvainConfig {
            resolution: 1.0,
            max_passes: 32,
            max_levels: 16,
        }
    }
}

impl LouvainConfig {
    pub fn validate(&self) -> Result<(), StoryError> {
        if !self.resolution.is_finite() || self.resolution <= 0.0 {
            return Err(StoryError::Config(format!(
                "louvain resolution must be a positive finite number, got {}",
                self.resolution
            )));
        }
        if self.max_passes == 0 || self.max_levels == 0 {
            return Err(StoryError::Config(
                "louvain max_passes and max_levels must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommunityDetection {
    pub assignment: CommunityMap,
    pub community_count: usize,
    pub modularity: f64,
    pub levels: usize,
}

/// Weighted undirected graph at one aggregation level.
struct LevelGraph {
    adjacency: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
}

impl LevelGraph {
    fn len(&self) -> usize {
        self.adjacency.len()
    }

    fn degrees(&self) -> Vec<f64> {
        self.adjacency
            .iter()
            .zip(self.self_loops.iter())
            .map(|(adj, self_loop)| adj.iter().map(|(_, w)| w).sum::<f64>() + 2.0 * self_loop)
            .collect()
    }

    /// Collapse each community into one node. Intra-community weight becomes a self-loop.
    fn aggregate(&self, community: &[usize], count: usize) -> LevelGraph {
        let mut self_loops = vec![0.0; count];
        let mut between: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for (i, self_loop) in self.self_loops.iter().enumerate() {
            self_loops[community[i]] += self_loop;
        }
        for (i, adj) in self.adjacency.iter().enumerate() {
            for &(j, w) in adj.iter() {
                // each undirected edge appears in both lists; count it once
                if j < i {
                    continue;
                }
                let (ci, cj) = (community[i], community[j]);
                if ci == cj {
                    self_loops[ci] += w;
                } else {
                    let key = if ci < cj { (ci, cj) } else { (cj, ci) };
                    *between.entry(key).or_default() += w;
                }
            }
        }
        let mut adjacency = vec![Vec::new(); count];
        for ((a, b), w) in between {
            adjacency[a].push((b, w));
            adjacency[b].push((a, w));
        }
        LevelGraph {
            adjacency,
            self_loops,
        }
    }
}

/// Run Louvain over `doc` and return the node -> community assignment.
pub fn detect_communities(
    doc: &GraphDocument,
    config: &LouvainConfig,
) -> Result<CommunityDetection, StoryError> {
    config.validate()?;
    let projection = UndirectedProjection::from_document(doc)?;
    let n = projection.node_count();
    if n == 0 {
        return Ok(CommunityDetection {
            assignment: CommunityMap::new(),
            community_count: 0,
            modularity: 0.0,
            levels: 0,
        });
    }

    let base = LevelGraph {
        adjacency: projection.adjacency(),
        self_loops: vec![0.0; n],
    };
    let mut membership: Vec<usize> = (0..n).collect();
    let mut levels = 0;

    if projection.edge_count() > 0 {
        let mut level = LevelGraph {
            adjacency: base.adjacency.clone(),
            self_loops: base.self_loops.clone(),
        };
        while levels < config.max_levels {
            let (community, moved) = local_moving(&level, config);
            if !moved {
                break;
            }
            levels += 1;
            let (community, count) = renumber(&community);
            for m in membership.iter_mut() {
                *m = community[*m];
            }
            if count == level.len() {
                break;
            }
            level = level.aggregate(&community, count);
        }
    }

    let (membership, community_count) = renumber(&membership);
    let modularity = modularity_of(&base, &membership, config.resolution);
    let assignment = membership
        .iter()
        .enumerate()
        .map(|(idx, c)| (projection.node_id(idx).to_string(), c.to_string()))
        .collect::<CommunityMap>();

    tracing::debug!(
        "[detect_communities] {} nodes, {} edges -> {} communities (Q = {:.4}, {} levels)",
        n,
        projection.edge_count(),
        community_count,
        modularity,
        levels
    );

    Ok(CommunityDetection {
        assignment,
        community_count,
        modularity,
        levels,
    })
}

/// Modularity of an existing assignment over `doc`'s undirected projection.
pub fn modularity(
    doc: &GraphDocument,
    assignment: &CommunityMap,
    resolution: f64,
) -> Result<f64, StoryError> {
    let projection = UndirectedProjection::from_document(doc)?;
    let mut ids: BTreeMap<&str, usize> = BTreeMap::new();
    let mut membership = Vec::with_capacity(projection.node_count());
    for idx in 0..projection.node_count() {
        let node_id = projection.node_id(idx);
        let community = assignment.get(node_id).ok_or_else(|| {
            StoryError::invariant(format!("node '{node_id}' has no community assignment"))
        })?;
        let next = ids.len();
        membership.push(*ids.entry(community.as_str()).or_insert(next));
    }
    let level = LevelGraph {
        adjacency: projection.adjacency(),
        self_loops: vec![0.0; projection.node_count()],
    };
    Ok(modularity_of(&level, &membership, resolution))
}

fn local_moving(level: &LevelGraph, config: &LouvainConfig) -> (Vec<usize>, bool) {
    let n = level.len();
    let degrees = level.degrees();
    let m2: f64 = degrees.iter().sum();
    let mut community: Vec<usize> = (0..n).collect();
    if m2 == 0.0 {
        return (community, false);
    }
    let mut totals = degrees.clone();
    let mut moved_any = false;

    for _ in 0..config.max_passes {
        let mut moved = false;
        for i in 0..n {
            let current = community[i];
            let k_i = degrees[i];

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for &(j, w) in level.adjacency[i].iter() {
                *links.entry(community[j]).or_default() += w;
            }

            totals[current] -= k_i;
            let gain = |c: usize, w: f64| w - config.resolution * totals[c] * k_i / m2;
            let mut best = current;
            let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
            for (&c, &w) in links.iter() {
                if c == current {
                    continue;
                }
                let g = gain(c, w);
                if g > best_gain + GAIN_EPSILON {
                    best_gain = g;
                    best = c;
                }
            }
            totals[best] += k_i;

            if best != current {
                community[i] = best;
                moved = true;
                moved_any = true;
            }
        }
        if !moved {
            break;
        }
    }
    (community, moved_any)
}

/// Contiguous ids in order of first appearance.
fn renumber(community: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: BTreeMap<usize, usize> = BTreeMap::new();
    let renumbered = community
        .iter()
        .map(|c| {
            let next = mapping.len();
            *mapping.entry(*c).or_insert(next)
        })
        .collect();
    (renumbered, mapping.len())
}

fn modularity_of(level: &LevelGraph, community: &[usize], resolution: f64) -> f64 {
    let degrees = level.degrees();
    let m2: f64 = degrees.iter().sum();
    if m2 == 0.0 {
        return 0.0;
    }
    let count = community.iter().max().map(|c| c + 1).unwrap_or(0);
    let mut internal = vec![0.0; count];
    let mut totals = vec![0.0; count];
    for (i, adj) in level.adjacency.iter().enumerate() {
        totals[community[i]] += degrees[i];
        internal[community[i]] += 2.0 * level.self_loops[i];
        for &(j, w) in adj.iter() {
            if community[i] == community[j] {
                internal[community[i]] += w;
            }
        }
    }
    internal
        .iter()
        .zip(totals.iter())
        .map(|(inside, total)| inside / m2 - resolution * (total / m2).powi(2))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::{node, rel, two_cliques};
    use std::collections::BTreeSet;

    #[test]
    fn empty_graph_has_no_communities() {
        let result = detect_communities(&GraphDocument::default(), &LouvainConfig::default())
            .unwrap();
        assert!(result.assignment.is_empty());
        assert_eq!(result.community_count, 0);
        assert_eq!(result.modularity, 0.0);
    }

    #[test]
    fn isolated_nodes_get_singleton_communities() {
        let doc = GraphDocument::new(vec![node("a"), node("b"), node("c")], vec![]);
        let result = detect_communities(&doc, &LouvainConfig::default()).unwrap();
        assert_eq!(result.assignment.len(), 3);
        assert_eq!(result.community_count, 3);
        assert_eq!(result.assignment["a"], "0");
        assert_eq!(result.assignment["b"], "1");
        assert_eq!(result.assignment["c"], "2");
    }

    #[test]
    fn every_node_is_assigned_exactly_once() {
        let doc = GraphDocument::new(
            (0..7).map(|i| node(&format!("n{i}"))).collect(),
            vec![
                rel("r1", "n0", "n1", "R"),
                rel("r2", "n2", "n3", "R"),
                rel("r3", "n3", "n4", "R"),
            ],
        );
        let result = detect_communities(&doc, &LouvainConfig::default()).unwrap();
        let ids: BTreeSet<&str> = result.assignment.keys().map(|k| k.as_str()).collect();
        let expected: BTreeSet<&str> = doc.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, expected);
        assert_eq!(result.assignment["n0"], result.assignment["n1"]);
        assert_ne!(result.assignment["n0"], result.assignment["n2"]);
    }

    #[test]
    fn two_cliques_split_on_the_bridge() {
        let doc = two_cliques();
        let result = detect_communities(&doc, &LouvainConfig::default()).unwrap();
        assert_eq!(result.community_count, 2);
        let a = &result.assignment;
        assert_eq!(a["a1"], a["a2"]);
        assert_eq!(a["a1"], a["a3"]);
        assert_eq!(a["a1"], a["a4"]);
        assert_eq!(a["b1"], a["b2"]);
        assert_eq!(a["b1"], a["b3"]);
        assert_eq!(a["b1"], a["b4"]);
        assert_ne!(a["a1"], a["b1"]);
        assert_eq!(a["a1"], "0");
        assert!(result.modularity > 0.3, "Q = {}", result.modularity);
    }

    #[test]
    fn detection_is_deterministic() {
        let doc = two_cliques();
        let config = LouvainConfig::default();
        let first = detect_communities(&doc, &config).unwrap();
        let second = detect_communities(&doc, &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn reported_modularity_matches_recomputation() {
        let doc = two_cliques();
        let result = detect_communities(&doc, &LouvainConfig::default()).unwrap();
        let q = modularity(&doc, &result.assignment, 1.0).unwrap();
        assert!((q - result.modularity).abs() < 1e-9);
    }

    #[test]
    fn invalid_resolution_is_rejected() {
        let config = LouvainConfig {
            resolution: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(
            detect_communities(&two_cliques(), &config),
            Err(StoryError::Config(_))
        ));
    }
}
