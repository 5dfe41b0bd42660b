use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Element, ElementId, ElementNode, PageId};
use crate::store::{StoreError, StoreResult};

/// In-memory snapshot of the elements of one or more pages.
///
/// Children are indexed by the raw `parent_id` stored on each row, so rows whose
/// parent is missing stay visible to the integrity scan instead of being dropped.
#[derive(Debug, Clone, Default)]
pub struct PageTree {
    elements: HashMap<ElementId, Element>,
    children: HashMap<Option<ElementId>, Vec<ElementId>>,
}

impl PageTree {
    pub fn new(elements: Vec<Element>) -> Self {
        let mut tree = PageTree {
            elements: elements.into_iter().map(|e| (e.id, e)).collect(),
            children: HashMap::new(),
        };
        tree.reindex();
        tree
    }

    fn reindex(&mut self) {
        let mut children: HashMap<Option<ElementId>, Vec<ElementId>> = HashMap::new();
        for element in self.elements.values() {
            children.entry(element.parent_id).or_default().push(element.id);
        }
        for siblings in children.values_mut() {
            siblings.sort_by_key(|id| self.elements[id].sibling_key());
        }
        self.children = children;
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.elements.contains_key(&id)
    }

    /// Children in `(order, id)` order
    pub fn children(&self, parent: Option<ElementId>) -> &[ElementId] {
        self.children.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Highest sibling order under `parent` on `page_id`
    pub fn max_order(&self, page_id: PageId, parent: Option<ElementId>) -> Option<i32> {
        self.children(parent)
            .iter()
            .filter_map(|id| self.elements.get(id))
            .filter(|e| e.page_id == page_id)
            .map(|e| e.order)
            .max()
    }

    /// Breadth-first walk from `root` (depth 0). Fails before returning anything
    /// if a node sits deeper than `max_depth`.
    pub fn collect_subtree(&self, root: ElementId, max_depth: usize) -> StoreResult<Vec<ElementId>> {
        if !self.contains(root) {
            return Err(StoreError::not_found("element", root));
        }

        let mut visited = HashSet::from([root]);
        let mut queue = VecDeque::from([(root, 0usize)]);
        let mut collected = Vec::new();

        while let Some((id, depth)) = queue.pop_front() {
            if depth > max_depth {
                return Err(StoreError::DepthExceeded { limit: max_depth });
            }
            collected.push(id);
            for &child in self.children(Some(id)) {
                if visited.insert(child) {
                    queue.push_back((child, depth + 1));
                }
            }
        }

        Ok(collected)
    }

    /// Whether `ancestor` is `node` itself or lies on its parent chain
    pub fn is_ancestor_or_self(&self, ancestor: ElementId, node: ElementId) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            if !seen.insert(id) {
                return false;
            }
            current = self.elements.get(&id).and_then(|e| e.parent_id);
        }
        false
    }

    /// Re-parent `id` in the snapshot. The caller validates the move first.
    pub fn set_parent(&mut self, id: ElementId, parent: Option<ElementId>) {
        if let Some(element) = self.elements.get_mut(&id) {
            element.parent_id = parent;
            self.reindex();
        }
    }

    /// Elements whose parent chain loops back to themselves
    pub fn cycle_members(&self) -> Vec<ElementId> {
        let mut members: Vec<ElementId> = self
            .elements
            .values()
            .filter(|e| {
                e.parent_id
                    .is_some_and(|parent| self.is_ancestor_or_self(e.id, parent))
            })
            .map(|e| e.id)
            .collect();
        members.sort_unstable();
        members
    }

    /// Every element in copy order: roots first, each child after its parent,
    /// siblings by `(order, id)`. Rows unreachable from a root (missing parent or
    /// cycle) and parents on another page are integrity errors.
    pub fn copy_order(&self) -> StoreResult<Vec<&Element>> {
        let mut ordered = Vec::with_capacity(self.elements.len());
        let mut visited = HashSet::new();
        let mut queue: VecDeque<ElementId> = self.children(None).iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let element = &self.elements[&id];
            for &child in self.children(Some(id)) {
                let child_page = self.elements[&child].page_id;
                if child_page != element.page_id {
                    return Err(StoreError::Integrity(format!(
                        "element {} on page {} has parent {} on page {}",
                        child, child_page, id, element.page_id
                    )));
                }
                queue.push_back(child);
            }
            ordered.push(element);
        }

        if ordered.len() != self.elements.len() {
            let mut stranded: Vec<ElementId> = self
                .elements
                .keys()
                .filter(|id| !visited.contains(id))
                .copied()
                .collect();
            stranded.sort_unstable();
            return Err(StoreError::Integrity(format!(
                "{} element(s) unreachable from any root: {:?}",
                stranded.len(),
                stranded
            )));
        }

        Ok(ordered)
    }

    /// Nested view of every tree reachable from a root. Fails if a node sits
    /// deeper than `max_depth`, roots being depth 0.
    pub fn ordered_forest(&self, max_depth: usize) -> StoreResult<Vec<ElementNode>> {
        // Breadth-first, so every node is listed after its parent
        let mut listed = Vec::with_capacity(self.elements.len());
        let mut queue: VecDeque<(ElementId, usize)> =
            self.children(None).iter().map(|&id| (id, 0)).collect();
        while let Some((id, depth)) = queue.pop_front() {
            if depth > max_depth {
                return Err(StoreError::DepthExceeded { limit: max_depth });
            }
            listed.push(id);
            queue.extend(self.children(Some(id)).iter().map(|&child| (child, depth + 1)));
        }

        // Children are assembled before their parents
        let mut built: HashMap<ElementId, ElementNode> = HashMap::with_capacity(listed.len());
        for &id in listed.iter().rev() {
            let Some(element) = self.elements.get(&id) else {
                continue;
            };
            let children = self
                .children(Some(id))
                .iter()
                .filter_map(|child| built.remove(child))
                .collect();
            built.insert(
                id,
                ElementNode {
                    element: element.clone(),
                    children,
                },
            );
        }

        Ok(self
            .children(None)
            .iter()
            .filter_map(|id| built.remove(id))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;

    pub(crate) fn element(id: ElementId, parent_id: Option<ElementId>, order: i32) -> Element {
        Element {
            id,
            page_id: 1,
            parent_id,
            order,
            element_type: "div".to_string(),
            content: None,
            styles: Default::default(),
            attributes: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// 1 -> 2 -> 3 -> ... -> n
    fn chain(n: i64) -> PageTree {
        PageTree::new(
            (1..=n)
                .map(|id| element(id, if id == 1 { None } else { Some(id - 1) }, 0))
                .collect(),
        )
    }

    #[test]
    fn test_collect_subtree_depth_boundary() {
        // Depths 0..=100 are allowed with a limit of 100
        let tree = chain(101);
        assert_eq!(tree.collect_subtree(1, 100).unwrap().len(), 101);

        let tree = chain(102);
        assert!(matches!(
            tree.collect_subtree(1, 100),
            Err(StoreError::DepthExceeded { limit: 100 })
        ));
        // A subtree rooted lower down is shallower
        assert_eq!(tree.collect_subtree(2, 100).unwrap().len(), 101);
    }

    #[test]
    fn test_collect_subtree_is_breadth_first() {
        let tree = PageTree::new(vec![
            element(1, None, 0),
            element(2, Some(1), 1),
            element(3, Some(1), 0),
            element(4, Some(2), 0),
            element(5, None, 1),
        ]);
        assert_eq!(tree.collect_subtree(1, 100).unwrap(), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_ancestry_and_cycles() {
        let mut tree = chain(4);
        assert!(tree.is_ancestor_or_self(1, 4));
        assert!(tree.is_ancestor_or_self(3, 3));
        assert!(!tree.is_ancestor_or_self(4, 1));
        assert!(tree.cycle_members().is_empty());

        tree.set_parent(1, Some(3));
        assert_eq!(tree.cycle_members(), vec![1, 2, 3]);
        assert!(tree.copy_order().is_err());
    }

    #[test]
    fn test_copy_order_parents_first() {
        let tree = PageTree::new(vec![
            element(10, Some(30), 0),
            element(20, None, 1),
            element(30, None, 0),
            element(40, Some(10), 0),
        ]);
        let ids: Vec<_> = tree.copy_order().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![30, 20, 10, 40]);
    }

    #[test]
    fn test_copy_order_rejects_orphans() {
        let tree = PageTree::new(vec![element(1, None, 0), element(2, Some(99), 0)]);
        match tree.copy_order() {
            Err(StoreError::Integrity(message)) => assert!(message.contains("[2]")),
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_ordered_forest_nests_children() {
        let tree = PageTree::new(vec![
            element(1, None, 0),
            element(2, Some(1), 5),
            element(3, Some(1), 1),
        ]);
        let forest = tree.ordered_forest(100).unwrap();
        assert_eq!(forest.len(), 1);
        let children: Vec<_> = forest[0].children.iter().map(|n| n.element.id).collect();
        assert_eq!(children, vec![3, 2]);
        assert_eq!(tree.max_order(1, Some(1)), Some(5));
        assert_eq!(tree.max_order(1, Some(3)), None);
    }

    #[test]
    fn test_ordered_forest_is_depth_bounded() {
        let forest = chain(5).ordered_forest(4).unwrap();
        let mut depth = 0;
        let mut node = &forest[0];
        while let Some(child) = node.children.first() {
            depth += 1;
            node = child;
        }
        assert_eq!(depth, 4);
        assert_eq!(node.element.id, 5);

        assert!(matches!(
            chain(6).ordered_forest(4),
            Err(StoreError::DepthExceeded { limit: 4 })
        ));

        // Rows caught in a cycle are unreachable from any root
        let tree = PageTree::new(vec![
            element(1, None, 0),
            element(2, Some(3), 0),
            element(3, Some(2), 0),
        ]);
        let forest = tree.ordered_forest(4).unwrap();
        assert_eq!(forest.len(), 1);
        assert!(forest[0].children.is_empty());
    }
}
