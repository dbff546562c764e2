use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};

use crate::common::collections::FxHashMap;
use crate::common::util::next_tick;
use crate::model::configuration::{Configuration, Rect, WindowingMode};
use crate::organizer::registry::OrganizerId;

slotmap::new_key_type! {
    /// Arena key for a node in the container hierarchy.
    pub struct ContainerId;
}

/// Server-issued opaque identity for a container, stable for its lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerToken(pub u64);

/// Client-chosen identity for an organized task fragment. Supplied at
/// creation time and echoed back in every event about that fragment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentToken(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerKind {
    Root,
    DisplayArea,
    Task,
    TaskFragment,
    Activity,
}

/// Where to place a container among its siblings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Position {
    Top,
    Bottom,
}

/// Animation overrides an organizer can attach to one of its fragments.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationParams {
    pub open_animation: u32,
    pub change_animation: u32,
    pub close_animation: u32,
    pub background_color: Option<u32>,
}

/// An insets source published by one container onto another.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InsetsProvider {
    pub owner: ContainerId,
    pub types: u32,
    pub frame: Rect,
}

#[derive(Debug, Clone)]
pub struct Container {
    pub kind: ContainerKind,
    pub token: ContainerToken,
    pub parent: Option<ContainerId>,
    /// Bottom-to-top; the last child is the topmost.
    pub children: Vec<ContainerId>,
    pub config: Configuration,
    /// Computed by the visibility pass, not set directly.
    pub visible: bool,
    pub force_hidden: bool,
    pub focusable: bool,
    pub created_by_organizer: bool,
    pub organizer: Option<OrganizerId>,
    pub client_token: Option<FragmentToken>,
    /// Whether an appeared event for this fragment has been delivered.
    pub appeared_sent: bool,
    pub uid: u32,
    pub pid: u32,
    pub min_width: i32,
    pub min_height: i32,
    pub finishing: bool,
    pub resizeable: bool,
    pub last_active_time: u64,
    pub delay_last_activity_removal: bool,
    pub adjacent: Option<ContainerId>,
    pub companion: Option<ContainerId>,
    /// Display-area launch routing, set through hierarchy operations.
    pub launch_root: Option<ContainerId>,
    pub launch_adjacent_root: Option<ContainerId>,
    pub reparent_leaf_task_if_relaunch: bool,
    pub animation_params: AnimationParams,
    pub insets_providers: Vec<InsetsProvider>,
}

impl Container {
    fn new(kind: ContainerKind, token: ContainerToken) -> Self {
        Container {
            kind,
            token,
            parent: None,
            children: Vec::new(),
            config: Configuration::default(),
            visible: false,
            force_hidden: false,
            focusable: true,
            created_by_organizer: false,
            organizer: None,
            client_token: None,
            appeared_sent: false,
            uid: 0,
            pid: 0,
            min_width: 0,
            min_height: 0,
            finishing: false,
            resizeable: true,
            last_active_time: 0,
            delay_last_activity_removal: false,
            adjacent: None,
            companion: None,
            launch_root: None,
            launch_adjacent_root: None,
            reparent_leaf_task_if_relaunch: false,
            animation_params: AnimationParams::default(),
            insets_providers: Vec::new(),
        }
    }

    pub fn windowing_mode(&self) -> WindowingMode { self.config.window.windowing_mode }

    pub fn is_task(&self) -> bool { self.kind == ContainerKind::Task }

    pub fn is_task_fragment(&self) -> bool { self.kind == ContainerKind::TaskFragment }

    pub fn is_activity(&self) -> bool { self.kind == ContainerKind::Activity }

    /// An embedded fragment is one created and managed by an organizer.
    pub fn is_organized_fragment(&self) -> bool {
        self.kind == ContainerKind::TaskFragment && self.organizer.is_some()
    }
}

/// Snapshot of an organized fragment as reported to its organizer.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentInfo {
    pub fragment_token: Option<FragmentToken>,
    pub container: ContainerToken,
    pub config: Configuration,
    pub is_empty: bool,
    pub running_activity_count: usize,
    pub is_visible: bool,
    /// Tokens of non-finishing activities, bottom to top.
    pub activities: Vec<ContainerToken>,
}

impl FragmentInfo {
    /// Equality as observed by an organizer, ignoring configuration (which is
    /// compared separately against the controllable masks).
    pub fn equals_for_organizer(&self, other: &FragmentInfo) -> bool {
        self.fragment_token == other.fragment_token
            && self.container == other.container
            && self.is_empty == other.is_empty
            && self.running_activity_count == other.running_activity_count
            && self.is_visible == other.is_visible
            && self.activities == other.activities
    }
}

/// The window container hierarchy: one arena of containers rooted at a
/// synthetic root node, with identity tokens for everything handed out of
/// process.
pub struct ContainerTree {
    nodes: SlotMap<ContainerId, Container>,
    by_token: FxHashMap<ContainerToken, ContainerId>,
    root: ContainerId,
    next_token: u64,
}

impl Default for ContainerTree {
    fn default() -> Self { Self::new() }
}

impl ContainerTree {
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let token = ContainerToken(1);
        let root = nodes.insert(Container::new(ContainerKind::Root, token));
        let mut by_token = FxHashMap::default();
        by_token.insert(token, root);
        ContainerTree { nodes, by_token, root, next_token: 2 }
    }

    pub fn root(&self) -> ContainerId { self.root }

    pub fn get(&self, id: ContainerId) -> Option<&Container> { self.nodes.get(id) }

    pub fn get_mut(&mut self, id: ContainerId) -> Option<&mut Container> { self.nodes.get_mut(id) }

    pub fn contains(&self, id: ContainerId) -> bool { self.nodes.contains_key(id) }

    pub fn token_of(&self, id: ContainerId) -> Option<ContainerToken> {
        self.nodes.get(id).map(|c| c.token)
    }

    pub fn resolve(&self, token: ContainerToken) -> Option<ContainerId> {
        self.by_token.get(&token).copied().filter(|id| self.nodes.contains_key(*id))
    }

    /// Allocates a detached container. The caller attaches it afterwards.
    pub fn create(&mut self, kind: ContainerKind) -> ContainerId {
        let token = ContainerToken(self.next_token);
        self.next_token += 1;
        let id = self.nodes.insert(Container::new(kind, token));
        self.by_token.insert(token, id);
        id
    }

    pub fn attach(&mut self, child: ContainerId, parent: ContainerId, position: Position) {
        debug_assert!(self.nodes[child].parent.is_none());
        self.nodes[child].parent = Some(parent);
        let siblings = &mut self.nodes[parent].children;
        match position {
            Position::Top => siblings.push(child),
            Position::Bottom => siblings.insert(0, child),
        }
    }

    /// Attaches `child` at an explicit index in `parent`'s bottom-to-top
    /// child list. Used for paired placement at creation.
    pub fn attach_at(&mut self, child: ContainerId, parent: ContainerId, index: usize) {
        debug_assert!(self.nodes[child].parent.is_none());
        self.nodes[child].parent = Some(parent);
        let siblings = &mut self.nodes[parent].children;
        let index = index.min(siblings.len());
        siblings.insert(index, child);
    }

    pub fn detach(&mut self, child: ContainerId) {
        if let Some(parent) = self.nodes[child].parent.take() {
            self.nodes[parent].children.retain(|c| *c != child);
        }
    }

    pub fn reparent(&mut self, child: ContainerId, new_parent: ContainerId, position: Position) {
        self.detach(child);
        self.attach(child, new_parent, position);
    }

    pub fn position_child(&mut self, parent: ContainerId, child: ContainerId, position: Position) {
        debug_assert_eq!(self.nodes[child].parent, Some(parent));
        let siblings = &mut self.nodes[parent].children;
        siblings.retain(|c| *c != child);
        match position {
            Position::Top => siblings.push(child),
            Position::Bottom => siblings.insert(0, child),
        }
    }

    /// Moves `child` directly below `sibling` in their shared parent.
    pub fn position_below(&mut self, child: ContainerId, sibling: ContainerId) {
        let Some(parent) = self.nodes[child].parent else { return };
        if self.nodes[sibling].parent != Some(parent) {
            return;
        }
        let siblings = &mut self.nodes[parent].children;
        siblings.retain(|c| *c != child);
        let at = siblings.iter().position(|c| *c == sibling).unwrap_or(0);
        siblings.insert(at, child);
    }

    /// Removes `id` and its whole subtree, returning the removed containers
    /// leaf-first so callers can fire vanish notifications bottom-up.
    pub fn remove_subtree(&mut self, id: ContainerId) -> Vec<(ContainerId, Container)> {
        self.detach(id);
        let mut order = Vec::new();
        self.collect_postorder(id, &mut order);
        let mut removed = Vec::with_capacity(order.len());
        for node in order {
            if let Some(container) = self.nodes.remove(node) {
                self.by_token.remove(&container.token);
                removed.push((node, container));
            }
        }
        removed
    }

    fn collect_postorder(&self, id: ContainerId, out: &mut Vec<ContainerId>) {
        for child in &self.nodes[id].children {
            self.collect_postorder(*child, out);
        }
        out.push(id);
    }

    pub fn parent_of(&self, id: ContainerId) -> Option<ContainerId> {
        self.nodes.get(id).and_then(|c| c.parent)
    }

    pub fn children(&self, id: ContainerId) -> &[ContainerId] { &self.nodes[id].children }

    pub fn ancestors(&self, id: ContainerId) -> impl Iterator<Item = ContainerId> + '_ {
        std::iter::successors(self.parent_of(id), move |cur| self.parent_of(*cur))
    }

    pub fn is_attached(&self, id: ContainerId) -> bool {
        if !self.nodes.contains_key(id) {
            return false;
        }
        id == self.root || self.ancestors(id).any(|a| a == self.root)
    }

    pub fn is_descendant_of(&self, id: ContainerId, ancestor: ContainerId) -> bool {
        self.ancestors(id).any(|a| a == ancestor)
    }

    /// The nearest enclosing task, including `id` itself.
    pub fn task_of(&self, id: ContainerId) -> Option<ContainerId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|c| self.nodes.get(*c).is_some_and(|n| n.is_task()))
    }

    pub fn display_area_of(&self, id: ContainerId) -> Option<ContainerId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|c| self.nodes.get(*c).is_some_and(|n| n.kind == ContainerKind::DisplayArea))
    }

    /// Effective bounds: an empty requested bounds inherits from the parent.
    pub fn effective_bounds(&self, id: ContainerId) -> Rect {
        let mut cur = Some(id);
        while let Some(node) = cur {
            let bounds = self.nodes[node].config.window.bounds;
            if !bounds.is_empty() {
                return bounds;
            }
            cur = self.nodes[node].parent;
        }
        Rect::default()
    }

    /// Whether the container ought to be visible given the current tree
    /// shape: attached, and neither it nor any ancestor is force-hidden or
    /// finishing.
    pub fn should_be_visible(&self, id: ContainerId) -> bool {
        if !self.is_attached(id) {
            return false;
        }
        std::iter::once(id).chain(self.ancestors(id)).all(|c| {
            let node = &self.nodes[c];
            !node.force_hidden && !node.finishing
        })
    }

    /// Topmost non-finishing activity in the subtree, searched top-down.
    pub fn top_running_activity(&self, id: ContainerId) -> Option<ContainerId> {
        let node = &self.nodes[id];
        if node.is_activity() {
            return (!node.finishing).then_some(id);
        }
        node.children
            .iter()
            .rev()
            .find_map(|child| self.top_running_activity(*child))
    }

    /// Bottom-most child activity that is still running.
    pub fn bottom_running_activity(&self, id: ContainerId) -> Option<ContainerId> {
        let node = &self.nodes[id];
        if node.is_activity() {
            return (!node.finishing).then_some(id);
        }
        node.children
            .iter()
            .find_map(|child| self.bottom_running_activity(*child))
    }

    pub fn running_activities(&self, id: ContainerId) -> Vec<ContainerId> {
        let mut out = Vec::new();
        self.collect_running(id, &mut out);
        out
    }

    fn collect_running(&self, id: ContainerId, out: &mut Vec<ContainerId>) {
        let node = &self.nodes[id];
        if node.is_activity() {
            if !node.finishing {
                out.push(id);
            }
            return;
        }
        for child in &node.children {
            self.collect_running(*child, out);
        }
    }

    pub fn has_running_activity(&self, id: ContainerId) -> bool {
        self.top_running_activity(id).is_some()
    }

    /// Largest minimum dimensions over the fragment's running activities.
    pub fn min_dimensions(&self, id: ContainerId) -> (i32, i32) {
        self.running_activities(id).iter().fold((0, 0), |(w, h), a| {
            let node = &self.nodes[*a];
            (w.max(node.min_width), h.max(node.min_height))
        })
    }

    pub fn fragment_info(&self, id: ContainerId) -> FragmentInfo {
        let node = &self.nodes[id];
        let running = self.running_activities(id);
        FragmentInfo {
            fragment_token: node.client_token,
            container: node.token,
            config: node.config,
            is_empty: running.is_empty(),
            running_activity_count: running.len(),
            is_visible: node.visible,
            activities: running.iter().map(|a| self.nodes[*a].token).collect(),
        }
    }

    /// Recomputes the cached visibility flag for the whole tree, stamping
    /// last-active time on containers that just became visible. Returns the
    /// set of containers whose flag flipped.
    pub fn update_visibility(&mut self) -> Vec<ContainerId> {
        let ids: Vec<ContainerId> = self.nodes.keys().collect();
        let mut flipped = Vec::new();
        let mut computed = SecondaryMap::new();
        for id in &ids {
            computed.insert(*id, self.should_be_visible(*id));
        }
        for id in ids {
            let visible = computed[id];
            let node = &mut self.nodes[id];
            if node.visible != visible {
                node.visible = visible;
                flipped.push(id);
            }
            if visible {
                node.last_active_time = next_tick();
            }
        }
        flipped
    }

    /// Renders the hierarchy for diagnostics.
    pub fn dump(&self) -> String {
        let tree = self.dump_node(self.root);
        let mut out = String::new();
        let _ = ascii_tree::write_tree(&mut out, &tree);
        out
    }

    fn dump_node(&self, id: ContainerId) -> ascii_tree::Tree {
        let node = &self.nodes[id];
        let bounds = node.config.window.bounds;
        let label = format!(
            "{:?} #{} mode={:?} visible={} bounds=[{},{}][{},{}]{}",
            node.kind,
            node.token.0,
            node.windowing_mode(),
            node.visible,
            bounds.left,
            bounds.top,
            bounds.right,
            bounds.bottom,
            if node.is_organized_fragment() { " organized" } else { "" },
        );
        // Children render top-to-bottom to match reading order.
        let children: Vec<ascii_tree::Tree> =
            node.children.iter().rev().map(|c| self.dump_node(*c)).collect();
        if children.is_empty() {
            ascii_tree::Tree::Leaf(vec![label])
        } else {
            ascii_tree::Tree::Node(label, children)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tree_with_task() -> (ContainerTree, ContainerId, ContainerId) {
        let mut tree = ContainerTree::new();
        let da = tree.create(ContainerKind::DisplayArea);
        tree.attach(da, tree.root(), Position::Top);
        let task = tree.create(ContainerKind::Task);
        tree.attach(task, da, Position::Top);
        (tree, da, task)
    }

    #[test]
    fn attach_orders_children_bottom_to_top() {
        let (mut tree, _da, task) = tree_with_task();
        let a = tree.create(ContainerKind::Activity);
        let b = tree.create(ContainerKind::Activity);
        let c = tree.create(ContainerKind::Activity);
        tree.attach(a, task, Position::Top);
        tree.attach(b, task, Position::Top);
        tree.attach(c, task, Position::Bottom);
        assert_eq!(tree.children(task), &[c, a, b]);
        assert_eq!(tree.top_running_activity(task), Some(b));
        assert_eq!(tree.bottom_running_activity(task), Some(c));
    }

    #[test]
    fn remove_subtree_is_leaf_first_and_unmaps_tokens() {
        let (mut tree, _da, task) = tree_with_task();
        let frag = tree.create(ContainerKind::TaskFragment);
        tree.attach(frag, task, Position::Top);
        let act = tree.create(ContainerKind::Activity);
        tree.attach(act, frag, Position::Top);
        let act_token = tree.token_of(act).unwrap();

        let removed = tree.remove_subtree(task);
        let ids: Vec<ContainerId> = removed.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![act, frag, task]);
        assert_eq!(tree.resolve(act_token), None);
        assert!(!tree.contains(frag));
    }

    #[test]
    fn detached_containers_are_invisible() {
        let (mut tree, _da, task) = tree_with_task();
        assert!(tree.should_be_visible(task));
        tree.detach(task);
        assert!(!tree.should_be_visible(task));
    }

    #[test]
    fn force_hidden_propagates_to_descendants() {
        let (mut tree, da, task) = tree_with_task();
        let act = tree.create(ContainerKind::Activity);
        tree.attach(act, task, Position::Top);
        tree.get_mut(da).unwrap().force_hidden = true;
        assert!(!tree.should_be_visible(act));

        let flipped = tree.update_visibility();
        assert!(!flipped.contains(&act));
        assert!(!tree.get(act).unwrap().visible);
    }

    #[test]
    fn visibility_pass_stamps_last_active_time() {
        let (mut tree, _da, task) = tree_with_task();
        assert_eq!(tree.get(task).unwrap().last_active_time, 0);
        let flipped = tree.update_visibility();
        assert!(flipped.contains(&task));
        assert!(tree.get(task).unwrap().last_active_time > 0);
    }

    #[test]
    fn fragment_info_reflects_running_activities() {
        let (mut tree, _da, task) = tree_with_task();
        let frag = tree.create(ContainerKind::TaskFragment);
        tree.attach(frag, task, Position::Top);
        let info = tree.fragment_info(frag);
        assert!(info.is_empty);

        let act = tree.create(ContainerKind::Activity);
        tree.attach(act, frag, Position::Top);
        let finishing = tree.create(ContainerKind::Activity);
        tree.get_mut(finishing).unwrap().finishing = true;
        tree.attach(finishing, frag, Position::Top);

        let info = tree.fragment_info(frag);
        assert!(!info.is_empty);
        assert_eq!(info.running_activity_count, 1);
        assert_eq!(info.activities, vec![tree.token_of(act).unwrap()]);
        assert!(!info.equals_for_organizer(&tree.fragment_info(task)));
    }

    #[test]
    fn min_dimensions_take_max_over_children() {
        let (mut tree, _da, task) = tree_with_task();
        let frag = tree.create(ContainerKind::TaskFragment);
        tree.attach(frag, task, Position::Top);
        for (w, h) in [(100, 50), (80, 120)] {
            let act = tree.create(ContainerKind::Activity);
            {
                let node = tree.get_mut(act).unwrap();
                node.min_width = w;
                node.min_height = h;
            }
            tree.attach(act, frag, Position::Top);
        }
        assert_eq!(tree.min_dimensions(frag), (100, 120));
    }

    #[test]
    fn effective_bounds_inherit_from_parent() {
        let (mut tree, da, task) = tree_with_task();
        tree.get_mut(da).unwrap().config.window.bounds = Rect::new(0, 0, 800, 600);
        assert_eq!(tree.effective_bounds(task), Rect::new(0, 0, 800, 600));
        tree.get_mut(task).unwrap().config.window.bounds = Rect::new(0, 0, 400, 600);
        assert_eq!(tree.effective_bounds(task), Rect::new(0, 0, 400, 600));
    }

    #[test]
    fn position_below_moves_in_front_sibling_order() {
        let (mut tree, da, task) = tree_with_task();
        let other = tree.create(ContainerKind::Task);
        tree.attach(other, da, Position::Top);
        assert_eq!(tree.children(da), &[task, other]);
        tree.position_below(other, task);
        assert_eq!(tree.children(da), &[other, task]);
    }

    #[test]
    fn dump_renders_every_node() {
        let (tree, _da, _task) = tree_with_task();
        let dump = tree.dump();
        assert!(dump.contains("Root"));
        assert!(dump.contains("DisplayArea"));
        assert!(dump.contains("Task"));
    }
}
