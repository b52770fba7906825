// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::resmap::ResMap,
    gang::ClusterTopology,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Granularity of resource competition.
///
/// The granularity fixes the bit domain of every resource map: nodes for
/// `Node` and `Cpu`, sockets for `Socket` and `Core`. At `Cpu` and `Core`
/// granularity an additional per-slot cpu vector resolves conflicts that the
/// bitmap alone cannot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GrType {
    Node,
    Socket,
    Core,
    Cpu,
}

/// Run-length encoded physical capacity per resource slot.
///
/// Clusters are bought in homogeneous batches, so the per-slot capacities
/// collapse into a handful of groups; lookup walks the groups.
#[derive(Clone, Debug, Default)]
struct PhysResCount {
    values: Vec<u16>,
    reps: Vec<u32>,
}

/// The scheduler's normalized view of cluster resources.
///
/// Derived once at startup from the configured granularity and the node
/// topology; converts a job's node allocation into the compact resource map
/// and cpu vector the row engine works with.
pub struct ResourceView {
    gr_type: GrType,
    fast_schedule: bool,
    node_count: usize,
    resmap_size: usize,
    phys: PhysResCount,
    topology: Box<dyn ClusterTopology + Send>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl GrType {
    /// Derives the granularity from the cluster's consumable-resource
    /// setting. Memory-only selection is node-level scheduling.
    pub fn from_select_type_param(param: &str) -> Self {
        match param {
            "cpu" | "cpu_memory" => GrType::Cpu,
            "socket" | "socket_memory" => GrType::Socket,
            "core" | "core_memory" => GrType::Core,
            _ => GrType::Node,
        }
    }
}

impl PhysResCount {
    fn push(&mut self, value: u16, reps: u32) {
        match self.values.last() {
            Some(last) if *last == value => {
                let slot: usize = self.reps.len() - 1;
                self.reps[slot] += reps;
            },
            _ => {
                self.values.push(value);
                self.reps.push(reps);
            },
        }
    }

    fn lookup(&self, slot: usize) -> u16 {
        let mut pos: usize = 0;
        for (value, reps) in self.values.iter().zip(self.reps.iter()) {
            pos += *reps as usize;
            if slot < pos {
                return *value;
            }
        }
        panic!("resource slot {} beyond physical capacity table", slot);
    }
}

impl ResourceView {
    /// Builds the resource view for the given granularity.
    pub fn new(gr_type: GrType, fast_schedule: bool, topology: Box<dyn ClusterTopology + Send>) -> Self {
        let mut view: ResourceView = Self {
            gr_type,
            fast_schedule,
            node_count: topology.node_count(),
            resmap_size: 0,
            phys: PhysResCount::default(),
            topology,
        };
        view.resmap_size = view.compute_resmap_size();
        view.load_phys_res_cnt();
        for (i, value) in view.phys.values.iter().enumerate() {
            debug!("new(): capacity group {:?}: {:?} cpus x {:?} slots", i, value, view.phys.reps[i]);
        }
        view
    }

    pub fn gr_type(&self) -> GrType {
        self.gr_type
    }

    /// Size of the resource-map bit domain.
    pub fn resmap_size(&self) -> usize {
        self.resmap_size
    }

    /// Returns whether this granularity resolves conflicts with cpu vectors.
    pub fn uses_cpu_array(&self) -> bool {
        matches!(self.gr_type, GrType::Cpu | GrType::Core)
    }

    /// Physical capacity of resource slot `slot`.
    pub fn phys_res_cnt(&self, slot: usize) -> u16 {
        self.phys.lookup(slot)
    }

    /// Converts a job's node allocation into a resource map in this view's
    /// bit domain. At socket granularity a bit is set only for sockets that
    /// actually hold allocated cores.
    pub fn job_resmap(&self, job_id: u32, node_bitmap: &ResMap) -> ResMap {
        assert_eq!(
            node_bitmap.size(),
            self.node_count,
            "node bitmap size changed for job {}: scheduler view is stale",
            job_id
        );
        match self.gr_type {
            GrType::Node | GrType::Cpu => node_bitmap.clone(),
            GrType::Socket | GrType::Core => {
                let mut resmap: ResMap = ResMap::new(self.resmap_size);
                let mut map_index: usize = 0;
                let mut alloc_index: usize = 0;
                for node in 0..self.node_count {
                    let sockets: usize = self.compute_resources(node, true) as usize;
                    if node_bitmap.test(node) {
                        for socket in 0..sockets {
                            if self.topology.job_cores(job_id, alloc_index, socket) > 0 {
                                resmap.set(map_index);
                            }
                            map_index += 1;
                        }
                        alloc_index += 1;
                    } else {
                        map_index += sockets;
                    }
                }
                resmap
            },
        }
    }

    /// Collects the job's allocated cpu counts, one entry per set resmap bit
    /// in bit-ascending order. `None` at node and socket granularity.
    pub fn alloc_cpus(&self, job_id: u32, node_bitmap: &ResMap) -> Option<Vec<u16>> {
        if !self.uses_cpu_array() {
            return None;
        }
        let mut cpus: Vec<u16> = Vec::new();
        let mut alloc_index: usize = 0;
        for node in 0..self.node_count {
            if !node_bitmap.test(node) {
                continue;
            }
            let sockets: usize = self.compute_resources(node, true) as usize;
            for socket in 0..sockets {
                let cores: u16 = self.topology.job_cores(job_id, alloc_index, socket);
                if cores > 0 {
                    cpus.push(cores);
                }
            }
            alloc_index += 1;
        }
        Some(cpus)
    }

    /// Resource count contributed by `node`: its socket count when
    /// `socket_view` is requested, otherwise one slot capacity in the
    /// configured granularity.
    fn compute_resources(&self, node: usize, socket_view: bool) -> u16 {
        match self.gr_type {
            GrType::Node => 1,
            GrType::Cpu => {
                if socket_view {
                    1
                } else {
                    self.topology.cpus(node, self.fast_schedule)
                }
            },
            GrType::Socket => self.topology.sockets(node, self.fast_schedule),
            GrType::Core => {
                if socket_view {
                    self.topology.sockets(node, self.fast_schedule)
                } else {
                    self.topology.cores(node, self.fast_schedule)
                }
            },
        }
    }

    fn compute_resmap_size(&self) -> usize {
        match self.gr_type {
            // One bit per node.
            GrType::Node | GrType::Cpu => self.node_count,
            // One bit per socket, summed across nodes.
            GrType::Socket | GrType::Core => (0..self.node_count)
                .map(|node: usize| self.compute_resources(node, true) as usize)
                .sum(),
        }
    }

    /// Loads the per-slot capacity table. At cpu granularity a slot is a
    /// node; at core granularity a slot is a socket, so a node repeats once
    /// per socket.
    fn load_phys_res_cnt(&mut self) {
        if !self.uses_cpu_array() {
            return;
        }
        let mut phys: PhysResCount = PhysResCount::default();
        for node in 0..self.node_count {
            let value: u16 = self.compute_resources(node, false);
            let reps: u32 = match self.gr_type {
                GrType::Core => self.compute_resources(node, true) as u32,
                _ => 1,
            };
            phys.push(value, reps);
        }
        self.phys = phys;
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        GrType,
        ResourceView,
    };
    use crate::{
        collections::resmap::ResMap,
        gang::ClusterTopology,
    };
    use ::anyhow::Result;

    /// A small uniform cluster: every node has 2 sockets x 4 cores, and
    /// every job holds 2 cores on every socket of its allocated nodes.
    struct UniformCluster {
        nodes: usize,
    }

    impl ClusterTopology for UniformCluster {
        fn node_count(&self) -> usize {
            self.nodes
        }

        fn cpus(&self, _node: usize, _fast: bool) -> u16 {
            8
        }

        fn sockets(&self, _node: usize, _fast: bool) -> u16 {
            2
        }

        fn cores(&self, _node: usize, _fast: bool) -> u16 {
            4
        }

        fn job_cores(&self, _job_id: u32, _alloc_node_index: usize, _socket_index: usize) -> u16 {
            2
        }
    }

    #[test]
    fn node_granularity_copies_the_node_bitmap() -> Result<()> {
        let view: ResourceView = ResourceView::new(GrType::Node, false, Box::new(UniformCluster { nodes: 4 }));
        crate::ensure_eq!(view.resmap_size(), 4);
        crate::ensure_eq!(view.uses_cpu_array(), false);

        let nodemap: ResMap = ResMap::from_indices(4, &[1, 3]);
        crate::ensure_eq!(view.job_resmap(42, &nodemap), nodemap);
        crate::ensure_eq!(view.alloc_cpus(42, &nodemap), None);
        Ok(())
    }

    #[test]
    fn core_granularity_expands_sockets() -> Result<()> {
        let view: ResourceView = ResourceView::new(GrType::Core, false, Box::new(UniformCluster { nodes: 3 }));
        // 3 nodes x 2 sockets.
        crate::ensure_eq!(view.resmap_size(), 6);

        let nodemap: ResMap = ResMap::from_indices(3, &[0, 2]);
        let resmap: ResMap = view.job_resmap(42, &nodemap);
        let bits: Vec<usize> = resmap.iter_set().collect();
        crate::ensure_eq!(bits, vec![0, 1, 4, 5]);

        let cpus: Vec<u16> = view.alloc_cpus(42, &nodemap).expect("core granularity has a cpu vector");
        crate::ensure_eq!(cpus, vec![2, 2, 2, 2]);
        // Every set bit has exactly one cpu entry.
        crate::ensure_eq!(cpus.len(), resmap.set_count());
        Ok(())
    }

    #[test]
    fn phys_res_cnt_is_run_length_encoded() -> Result<()> {
        let view: ResourceView = ResourceView::new(GrType::Core, false, Box::new(UniformCluster { nodes: 3 }));
        // Cores per socket, one slot per socket.
        for slot in 0..6 {
            crate::ensure_eq!(view.phys_res_cnt(slot), 4);
        }
        crate::ensure_eq!(view.phys.values.len(), 1);
        crate::ensure_eq!(view.phys.reps, vec![6]);
        Ok(())
    }

    #[test]
    fn cpu_granularity_counts_whole_nodes() -> Result<()> {
        let view: ResourceView = ResourceView::new(GrType::Cpu, false, Box::new(UniformCluster { nodes: 2 }));
        crate::ensure_eq!(view.resmap_size(), 2);
        crate::ensure_eq!(view.phys_res_cnt(0), 8);
        crate::ensure_eq!(view.phys_res_cnt(1), 8);
        Ok(())
    }

    #[test]
    fn select_type_param_mapping() -> Result<()> {
        crate::ensure_eq!(GrType::from_select_type_param("cpu"), GrType::Cpu);
        crate::ensure_eq!(GrType::from_select_type_param("core_memory"), GrType::Core);
        crate::ensure_eq!(GrType::from_select_type_param("socket"), GrType::Socket);
        crate::ensure_eq!(GrType::from_select_type_param("memory"), GrType::Node);
        crate::ensure_eq!(GrType::from_select_type_param(""), GrType::Node);
        Ok(())
    }
}
