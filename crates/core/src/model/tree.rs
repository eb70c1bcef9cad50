use ticktree_sync::{Clock, MonotonicClock, Team};

use crate::model::{NodeId, TimerError, TimerNode};

/// Id of the implicit root timer ("total"), pre-created and started when
/// the tree is built. It spans the whole profiling session and is never
/// explicitly stopped by a caller.
pub const ROOT_ID: NodeId = 0;

/// The timer tree: an append-only arena of [`TimerNode`]s plus the cursor
/// tracking the innermost running timer for this execution context.
///
/// Ids double as indices into the arena, children always have strictly
/// greater ids than their parent, and nodes are never removed or
/// relabeled — so the tree is acyclic by construction and every id stays
/// valid for the tree's lifetime.
///
/// One tree is created per execution context (typically per worker
/// thread). Start/stop calls within a context must nest like balanced
/// parentheses; the cursor is the explicit state of that machine. When a
/// whole team instruments the same region, node creation goes through
/// [`Team::agree`] so every context resolves the label to the same id —
/// downstream consumers merge trees by id and by structural hash and
/// assume identical shape across contexts.
#[derive(Debug)]
pub struct TimerTree<C = MonotonicClock> {
    nodes: Vec<TimerNode>,
    current: NodeId,
    clock: C,
    contexts: u32,
}

impl TimerTree {
    /// A tree for a single context, timed by a fresh monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }
}

impl Default for TimerTree {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> TimerTree<C> {
    /// A tree timed by an injected clock; the core never reads a wall
    /// clock of its own.
    pub fn with_clock(clock: C) -> Self {
        Self::with_clock_and_contexts(clock, 1)
    }

    /// As [`with_clock`], additionally stamping each node with the number
    /// of participating contexts used by the average-time convention.
    ///
    /// [`with_clock`]: TimerTree::with_clock
    pub fn with_clock_and_contexts(clock: C, contexts: u32) -> Self {
        let now = clock.now();
        let mut root = TimerNode::new(ROOT_ID, None, "total", &["Total"], None, contexts);
        // A fresh node is never running, so this cannot fail.
        root.start(now).ok();
        Self {
            nodes: vec![root],
            current: ROOT_ID,
            clock,
            contexts,
        }
    }

    /// Resolve `label` to a child of the cursor, creating the node on
    /// first use. Idempotent: re-initializing an existing label returns
    /// the existing id and ignores `groups` / `work_unit_label`.
    pub fn initialize_timer(
        &mut self,
        label: &str,
        groups: &[&str],
        work_unit_label: Option<&str>,
    ) -> NodeId {
        if let Some(existing) = self.child_id(label) {
            return existing;
        }
        let id = self.nodes.len();
        let node = TimerNode::new(
            id,
            Some(self.current),
            label,
            groups,
            work_unit_label,
            self.contexts,
        );
        self.nodes[self.current].add_child(id);
        self.nodes.push(node);
        id
    }

    /// Team-agreed creation: the leader resolves the label and publishes
    /// the id through `team`, every participant reads the published id
    /// after the rendezvous, and each context then materializes the node
    /// locally. All members of the team must make this call for the same
    /// label; a member that skips it deadlocks its peers.
    ///
    /// If the locally resolved id disagrees with the published one, the
    /// per-context trees have diverged in shape — a hard usage error this
    /// core reports but does not reconcile.
    pub fn initialize_timer_team<T: Team>(
        &mut self,
        team: &T,
        label: &str,
        groups: &[&str],
        work_unit_label: Option<&str>,
    ) -> Result<NodeId, TimerError> {
        let agreed = team.agree(|| self.initialize_timer(label, groups, work_unit_label));
        let local = self.initialize_timer(label, groups, work_unit_label);
        if local != agreed {
            return Err(TimerError::TreeShapeDiverged {
                label: label.to_string(),
                agreed,
                local,
            });
        }
        Ok(agreed)
    }

    /// Look up `label` among the children of the cursor without creating
    /// anything. Linear scan: trees are shallow and wide, and sibling
    /// labels are unique by invariant.
    pub fn child_id(&self, label: &str) -> Option<NodeId> {
        self.nodes[self.current]
            .child_ids()
            .iter()
            .copied()
            .find(|&child| self.nodes[child].label() == label)
    }

    /// Start the timer for `label` under the cursor, creating it on first
    /// use, and descend the cursor into it.
    pub fn start(&mut self, label: &str) -> Result<NodeId, TimerError> {
        let id = self.initialize_timer(label, &[], None);
        self.start_id(id)?;
        Ok(id)
    }

    /// Start a label all members of a team reach together; creation goes
    /// through the agreement protocol of [`initialize_timer_team`].
    ///
    /// [`initialize_timer_team`]: TimerTree::initialize_timer_team
    pub fn start_team<T: Team>(&mut self, team: &T, label: &str) -> Result<NodeId, TimerError> {
        let id = self.initialize_timer_team(team, label, &[], None)?;
        self.start_id(id)?;
        Ok(id)
    }

    /// Hot path: start an already-resolved timer directly, skipping the
    /// label lookup and any team agreement. The id must denote a child of
    /// the cursor.
    pub fn start_id(&mut self, id: NodeId) -> Result<(), TimerError> {
        let now = self.clock.now();
        let current = self.current;
        let node = self.nodes.get_mut(id).ok_or(TimerError::UnknownId(id))?;
        if node.parent_id() != Some(current) {
            return Err(TimerError::NotAChild {
                label: node.label().to_string(),
            });
        }
        node.start(now)?;
        self.current = id;
        Ok(())
    }

    /// Stop the timer at the cursor and ascend. Returns the new cursor.
    pub fn stop(&mut self) -> Result<NodeId, TimerError> {
        self.stop_current(0.0, None)
    }

    /// Stop the timer at the cursor, checking that `id` actually is the
    /// active timer — start/stop must nest like balanced parentheses, and
    /// an out-of-order stop is a usage error.
    pub fn stop_id(&mut self, id: NodeId) -> Result<NodeId, TimerError> {
        if id != self.current {
            return Err(TimerError::StopMismatch {
                expected: self.current,
                got: id,
            });
        }
        self.stop_current(0.0, None)
    }

    /// Stop the timer at the cursor, checking the label matches.
    pub fn stop_label(&mut self, label: &str) -> Result<NodeId, TimerError> {
        self.check_active_label(label)?;
        self.stop_current(0.0, None)
    }

    /// Stop the timer at the cursor and credit it with a work-unit
    /// quantity (e.g. cells processed) for throughput reporting. The unit
    /// label is recorded on first use.
    pub fn stop_with_work(
        &mut self,
        work_units: f64,
        work_unit_label: Option<&str>,
    ) -> Result<NodeId, TimerError> {
        self.stop_current(work_units, work_unit_label)
    }

    /// As [`stop_with_work`], checking `id` against the cursor first.
    ///
    /// [`stop_with_work`]: TimerTree::stop_with_work
    pub fn stop_id_with_work(
        &mut self,
        id: NodeId,
        work_units: f64,
        work_unit_label: Option<&str>,
    ) -> Result<NodeId, TimerError> {
        if id != self.current {
            return Err(TimerError::StopMismatch {
                expected: self.current,
                got: id,
            });
        }
        self.stop_current(work_units, work_unit_label)
    }

    /// As [`stop_with_work`], checking the label against the cursor first.
    ///
    /// [`stop_with_work`]: TimerTree::stop_with_work
    pub fn stop_label_with_work(
        &mut self,
        label: &str,
        work_units: f64,
        work_unit_label: Option<&str>,
    ) -> Result<NodeId, TimerError> {
        self.check_active_label(label)?;
        self.stop_current(work_units, work_unit_label)
    }

    fn check_active_label(&self, label: &str) -> Result<(), TimerError> {
        let active = self.nodes[self.current].label();
        if active != label {
            return Err(TimerError::LabelMismatch {
                expected: active.to_string(),
                got: label.to_string(),
            });
        }
        Ok(())
    }

    fn stop_current(
        &mut self,
        work_units: f64,
        work_unit_label: Option<&str>,
    ) -> Result<NodeId, TimerError> {
        if self.current == ROOT_ID {
            return Err(TimerError::StopAtRoot);
        }
        let now = self.clock.now();
        let parent = self.nodes[self.current].stop_with_work(now, work_units, work_unit_label)?;
        // Every non-root node has a parent.
        self.current = parent.unwrap_or(ROOT_ID);
        Ok(self.current)
    }

    /// This node's average time only — no aggregation over children.
    pub fn time(&self, id: NodeId) -> Result<f64, TimerError> {
        Ok(self.lookup(id)?.average_time())
    }

    /// Total time attributed to `group` in the subtree rooted at `id`.
    ///
    /// A node tagged with the group contributes its own time and is not
    /// descended into: its time already covers its whole subtree for that
    /// group, and descending would double-count. Untagged nodes contribute
    /// nothing themselves and the search continues below them.
    pub fn group_time(&self, group: &str, id: NodeId) -> Result<f64, TimerError> {
        self.lookup(id)?;
        let mut total = 0.0;
        // Children have strictly greater ids than their parent, so the
        // walk terminates; an explicit stack keeps deep trees off the call
        // stack.
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            let node = &self.nodes[next];
            if node.groups().iter().any(|tag| tag == group) {
                total += node.average_time();
            } else {
                pending.extend_from_slice(node.child_ids());
            }
        }
        Ok(total)
    }

    /// Structural hash of the subtree rooted at `id`: the wrapping sum of
    /// every descendant's identity hash, folded into the positive `i32`
    /// range. Never 0 — a raw sum of exactly 0 reports 1, since 0 is
    /// reserved downstream to mean "no consistency check requested".
    ///
    /// Contexts that built identically-shaped trees report identical
    /// hashes; any label, group, or work-unit-label difference changes
    /// the value with overwhelming probability.
    pub fn hash(&self, id: NodeId) -> Result<i32, TimerError> {
        self.lookup(id)?;
        let mut sum: u64 = 0;
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            let node = &self.nodes[next];
            sum = sum.wrapping_add(node.identity_hash());
            pending.extend_from_slice(node.child_ids());
        }
        if sum == 0 {
            Ok(1)
        } else {
            Ok((sum % i32::MAX as u64) as i32)
        }
    }

    /// Full hierarchical name of `id`, excluding the root: `"/A/B"` with
    /// the outermost label first, or `"B\A\"` innermost-first when
    /// `reverse` is set.
    pub fn full_label(&self, id: NodeId, reverse: bool) -> Result<String, TimerError> {
        self.lookup(id)?;
        let mut labels = Vec::new();
        let mut walk = id;
        while walk != ROOT_ID {
            let node = &self.nodes[walk];
            labels.push(node.label());
            walk = node.parent_id().unwrap_or(ROOT_ID);
        }

        let mut full = String::new();
        if reverse {
            for label in &labels {
                full.push_str(label);
                full.push('\\');
            }
        } else {
            for label in labels.iter().rev() {
                full.push('/');
                full.push_str(label);
            }
        }
        Ok(full)
    }

    /// Measure `id` and its direct children from `baseline_wall_time`
    /// forward, e.g. to exclude a warm-up phase. Deliberately shallow:
    /// callers wanting a subtree-wide reset recurse themselves.
    pub fn reset_time(&mut self, baseline_wall_time: f64, id: NodeId) -> Result<(), TimerError> {
        self.lookup(id)?;
        self.nodes[id].reset_time(baseline_wall_time);
        let children = self.nodes[id].child_ids().to_vec();
        for child in children {
            self.nodes[child].reset_time(baseline_wall_time);
        }
        Ok(())
    }

    /// Shift the active start time of `id` and its direct children
    /// forward by `delta`, excluding e.g. the cost of emitting a report
    /// from the timers wrapping it. Shallow, like [`reset_time`].
    ///
    /// [`reset_time`]: TimerTree::reset_time
    pub fn shift_active_start_time(&mut self, delta: f64, id: NodeId) -> Result<(), TimerError> {
        self.lookup(id)?;
        self.nodes[id].shift_active_start_time(delta);
        let children = self.nodes[id].child_ids().to_vec();
        for child in children {
            self.nodes[child].shift_active_start_time(delta);
        }
        Ok(())
    }

    /// Read access to a node, for reporting layers.
    pub fn node(&self, id: NodeId) -> Option<&TimerNode> {
        self.nodes.get(id)
    }

    /// The innermost currently-running timer for this context.
    pub fn current(&self) -> NodeId {
        self.current
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The injected clock, e.g. for sessions that timestamp their own
    /// bookkeeping with the same time base.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn lookup(&self, id: NodeId) -> Result<&TimerNode, TimerError> {
        self.nodes.get(id).ok_or(TimerError::UnknownId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticktree_sync::{ManualClock, SoloTeam};

    fn make_tree() -> TimerTree<ManualClock> {
        TimerTree::with_clock(ManualClock::new(0.0))
    }

    #[test]
    fn root_is_precreated_and_running() {
        let tree = make_tree();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.current(), ROOT_ID);
        let root = tree.node(ROOT_ID).expect("root exists");
        assert!(root.is_running());
        assert_eq!(root.label(), "total");
        assert_eq!(root.groups(), ["Total"]);
        assert_eq!(root.parent_id(), None);
    }

    #[test]
    fn scenario_two_levels_and_back() {
        let mut tree = make_tree();
        let step1 = tree.start("Step1").expect("starts");
        assert_eq!(step1, 1);
        assert_eq!(tree.current(), 1);
        let step2 = tree.start("Step2").expect("starts");
        assert_eq!(step2, 2);
        assert_eq!(tree.current(), 2);
        tree.stop().expect("stops Step2");
        tree.stop().expect("stops Step1");
        assert_eq!(tree.current(), ROOT_ID);
        assert_eq!(
            tree.full_label(2, false).expect("known id"),
            "/Step1/Step2"
        );
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut tree = make_tree();
        let first = tree.initialize_timer("io", &["IO"], Some("bytes"));
        let again = tree.initialize_timer("io", &["ignored-on-hit"], None);
        assert_eq!(first, again);
        assert_eq!(tree.node_count(), 2);
        // The hit ignored the differing arguments.
        let node = tree.node(first).expect("exists");
        assert_eq!(node.groups(), ["IO"]);
        assert_eq!(node.work_unit_label(), Some("bytes"));
    }

    #[test]
    fn same_label_under_different_parents_is_distinct() {
        let mut tree = make_tree();
        tree.start("Step1").expect("starts");
        let inner_a = tree.start("compute").expect("starts");
        tree.stop().expect("stops");
        tree.stop().expect("stops");
        tree.start("Step2").expect("starts");
        let inner_b = tree.start("compute").expect("starts");
        assert_ne!(inner_a, inner_b);
        assert_eq!(
            tree.full_label(inner_b, false).expect("known id"),
            "/Step2/compute"
        );
    }

    #[test]
    fn start_id_skips_lookup_but_keeps_discipline() {
        let mut tree = make_tree();
        let id = tree.start("region").expect("starts");
        tree.stop().expect("stops");

        // Hot path: the resolved id starts directly.
        tree.start_id(id).expect("restarts");
        tree.stop_id(id).expect("stops");

        // A node that is not a child of the cursor cannot start.
        tree.start("other").expect("starts");
        assert_eq!(
            tree.start_id(id),
            Err(TimerError::NotAChild {
                label: "region".into()
            })
        );
    }

    #[test]
    fn stop_checks_are_usage_errors_not_state_changes() {
        let mut tree = make_tree();
        let id = tree.start("region").expect("starts");
        assert_eq!(
            tree.stop_id(99),
            Err(TimerError::StopMismatch {
                expected: id,
                got: 99
            })
        );
        assert_eq!(
            tree.stop_label("elsewhere"),
            Err(TimerError::LabelMismatch {
                expected: "region".into(),
                got: "elsewhere".into()
            })
        );
        // The failed stops left the cursor alone.
        assert_eq!(tree.current(), id);
        tree.stop_label("region").expect("stops");
        assert_eq!(tree.stop(), Err(TimerError::StopAtRoot));
    }

    #[test]
    fn elapsed_time_flows_through_the_clock() {
        let mut tree = make_tree();
        tree.start("solve").expect("starts");
        tree.clock().advance(2.0);
        let id = tree.current();
        tree.stop().expect("stops");
        assert_eq!(tree.time(id).expect("known id"), 2.0);
    }

    #[test]
    fn work_units_reach_the_node() {
        let mut tree = make_tree();
        let id = tree.start("propagate").expect("starts");
        tree.clock().advance(1.0);
        tree.stop_with_work(512.0, Some("cells")).expect("stops");
        let node = tree.node(id).expect("exists");
        assert_eq!(node.work_units(), 512.0);
        assert_eq!(node.work_unit_label(), Some("cells"));
    }

    #[test]
    fn group_time_short_circuits_on_match() {
        let mut tree = make_tree();
        let outer = tree.initialize_timer("outer", &["G"], None);
        tree.start_id(outer).expect("starts");
        tree.clock().advance(10.0);
        // Descendant also tagged G must not be double-counted.
        let inner = tree.initialize_timer("inner", &["G"], None);
        tree.start_id(inner).expect("starts");
        tree.clock().advance(3.0);
        tree.stop().expect("stops inner");
        tree.stop().expect("stops outer");

        assert_eq!(tree.group_time("G", outer).expect("known id"), 13.0);
        assert_eq!(
            tree.group_time("G", outer).expect("known id"),
            tree.time(outer).expect("known id")
        );
    }

    #[test]
    fn group_time_sums_over_untagged_parent() {
        let mut tree = make_tree();
        tree.start("step").expect("starts");
        let c1 = tree.initialize_timer("io", &["G"], None);
        tree.start_id(c1).expect("starts");
        tree.clock().advance(2.0);
        tree.stop().expect("stops");
        let c2 = tree.initialize_timer("mpi", &["G"], None);
        tree.start_id(c2).expect("starts");
        tree.clock().advance(5.0);
        tree.stop().expect("stops");
        let step = tree.current();
        tree.stop().expect("stops step");

        // "step" itself is not in G: its children's times sum.
        assert_eq!(tree.group_time("G", step).expect("known id"), 7.0);
        assert_eq!(tree.group_time("G", ROOT_ID).expect("known id"), 7.0);
        assert_eq!(tree.group_time("absent", step).expect("known id"), 0.0);
    }

    #[test]
    fn hash_is_stable_and_structure_sensitive() {
        let mut tree = make_tree();
        tree.start("Step1").expect("starts");
        tree.stop().expect("stops");
        let before = tree.hash(ROOT_ID).expect("hashes");
        assert_eq!(before, tree.hash(ROOT_ID).expect("hashes"));
        assert!(before > 0);

        // Timing changes do not move the hash.
        tree.start("Step1").expect("restarts");
        tree.clock().advance(4.0);
        tree.stop().expect("stops");
        assert_eq!(before, tree.hash(ROOT_ID).expect("hashes"));

        // Structural changes do.
        tree.start("Step2").expect("starts");
        tree.stop().expect("stops");
        assert_ne!(before, tree.hash(ROOT_ID).expect("hashes"));
    }

    #[test]
    fn identically_built_trees_hash_identically() {
        let build = || {
            let mut tree = make_tree();
            tree.initialize_timer("a", &["IO"], None);
            tree.start("b").expect("starts");
            tree.start("c").expect("starts");
            tree.stop().expect("stops");
            tree.stop().expect("stops");
            tree
        };
        let left = build();
        let right = build();
        assert_eq!(
            left.hash(ROOT_ID).expect("hashes"),
            right.hash(ROOT_ID).expect("hashes")
        );
    }

    #[test]
    fn full_label_orders() {
        let mut tree = make_tree();
        tree.start("A").expect("starts");
        let b = tree.start("B").expect("starts");
        assert_eq!(tree.full_label(b, false).expect("known id"), "/A/B");
        assert_eq!(tree.full_label(b, true).expect("known id"), "B\\A\\");
        assert_eq!(tree.full_label(ROOT_ID, false).expect("known id"), "");
    }

    #[test]
    fn reset_is_shallow() {
        let mut tree = make_tree();
        let step = tree.start("step").expect("starts");
        let child = tree.start("child").expect("starts");
        let grandchild = tree.start("grandchild").expect("starts");
        tree.clock().advance(1.0);
        tree.stop().expect("stops grandchild");
        tree.clock().advance(1.0);
        tree.stop().expect("stops child");
        tree.clock().advance(1.0);
        tree.stop().expect("stops step");

        tree.reset_time(100.0, step).expect("known id");
        assert_eq!(tree.time(step).expect("known id"), 0.0);
        assert_eq!(tree.time(child).expect("known id"), 0.0);
        // Direct children only: the grandchild keeps its measurement.
        assert_eq!(tree.time(grandchild).expect("known id"), 1.0);
    }

    #[test]
    fn shift_is_shallow_and_touches_only_running_nodes() {
        let mut tree = make_tree();
        let outer = tree.start("outer").expect("starts");
        let inner = tree.start("inner").expect("starts");
        tree.clock().advance(10.0);

        // Shift both running timers forward 4s from the outer node down.
        tree.shift_active_start_time(4.0, outer).expect("known id");
        tree.stop().expect("stops inner");
        tree.stop().expect("stops outer");
        assert_eq!(tree.time(inner).expect("known id"), 6.0);
        assert_eq!(tree.time(outer).expect("known id"), 6.0);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let mut tree = make_tree();
        assert_eq!(tree.time(42), Err(TimerError::UnknownId(42)));
        assert_eq!(tree.hash(42), Err(TimerError::UnknownId(42)));
        assert_eq!(tree.full_label(42, false), Err(TimerError::UnknownId(42)));
        assert_eq!(tree.reset_time(0.0, 42), Err(TimerError::UnknownId(42)));
        assert_eq!(tree.start_id(42), Err(TimerError::UnknownId(42)));
    }

    #[test]
    fn solo_team_agreement_matches_local_resolution() {
        let mut tree = make_tree();
        let team = SoloTeam;
        let first = tree
            .initialize_timer_team(&team, "Region", &[], None)
            .expect("agrees");
        let again = tree
            .initialize_timer_team(&team, "Region", &[], None)
            .expect("agrees");
        assert_eq!(first, again);

        let started = tree.start_team(&team, "Region").expect("starts");
        assert_eq!(started, first);
        assert_eq!(tree.current(), started);
        tree.stop().expect("stops");
    }
}
