// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::resmap::ResMap,
    gang::resources::{
        GrType,
        ResourceView,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Signal state of a gang-scheduled job. Orthogonal to [RowState] but kept in
/// lockstep with it: leaving the active row drives a suspend, (re)admission
/// drives a resume, and a job already in the target state is never
/// re-signalled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SigState {
    Resume,
    Suspend,
}

/// Membership of a job in its partition's active row.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RowState {
    /// Not admitted; the job is (or is about to be) suspended.
    NoActive,
    /// Admitted in rotation order.
    Active,
    /// Admitted opportunistically after the rotation order was decided;
    /// reset to [RowState::NoActive] at the start of every rotation.
    Filler,
}

/// A job as the gang scheduler tracks it.
///
/// `alloc_cpus` holds one entry per set `resmap` bit, in bit-ascending
/// order, and is present exactly at cpu/core granularity.
#[derive(Clone, Debug)]
pub struct GsJob {
    pub job_id: u32,
    pub sig_state: SigState,
    pub row_state: RowState,
    pub resmap: ResMap,
    pub alloc_cpus: Option<Vec<u16>>,
}

/// Per-partition scheduling state.
///
/// `jobs` holds the ids of the jobs this partition owns, in rotation order.
/// `shadows` holds non-owning back-references to jobs owned by strictly
/// higher-priority partitions whose resources overlap; both are resolved
/// against the scheduler's job arena at use.
#[derive(Debug)]
pub struct GsPart {
    pub name: String,
    pub priority: u16,
    pub jobs: Vec<u32>,
    pub shadows: Vec<u32>,
    pub active_resmap: Option<ResMap>,
    pub active_cpus: Option<Vec<u16>>,
    pub jobs_active: u32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl GsPart {
    pub fn new(name: String, priority: u16) -> Self {
        Self {
            name,
            priority,
            jobs: Vec::new(),
            shadows: Vec::new(),
            active_resmap: None,
            active_cpus: None,
            jobs_active: 0,
        }
    }

    /// Decides whether `job` can run concurrently with the current active row.
    ///
    /// At node and socket granularity any bit conflict is a loss. At cpu and
    /// core granularity a conflicting slot is still fine as long as the
    /// combined cpu demand stays within the slot's physical capacity.
    pub fn job_fits_in_active_row(&self, job: &GsJob, view: &ResourceView) -> bool {
        let active: &ResMap = match self.active_resmap.as_ref() {
            Some(active) if self.jobs_active > 0 => active,
            _ => return true,
        };
        let conflicts: usize = job.resmap.and_count(active);
        debug!("job_fits_in_active_row(): job {:?}: {:?} bits conflict", job.job_id, conflicts);
        if conflicts == 0 {
            return true;
        }
        if matches!(view.gr_type(), GrType::Node | GrType::Socket) {
            return false;
        }

        let active_cpus: &Vec<u16> = match self.active_cpus.as_ref() {
            Some(active_cpus) => active_cpus,
            None => return false,
        };
        let job_cpus: &Vec<u16> = job
            .alloc_cpus
            .as_ref()
            .expect("cpu granularity jobs carry an alloc_cpus vector");
        for (rank, slot) in job.resmap.iter_set().enumerate() {
            if active.test(slot) && active_cpus[slot] + job_cpus[rank] > view.phys_res_cnt(slot) {
                return false;
            }
        }
        true
    }

    /// Merges `job` into the active row and bumps the admission count.
    ///
    /// With no prior admissions the row is overwritten rather than merged.
    /// Per-slot cpu sums clamp at the slot's physical capacity; the clamp
    /// matters when a shadow whose own demand already saturates a slot is
    /// merged in.
    pub fn add_job_to_active(&mut self, job: &GsJob, view: &ResourceView) {
        match self.active_resmap.as_mut() {
            None => {
                debug!("add_job_to_active(): using job {:?} as active base", job.job_id);
                self.active_resmap = Some(job.resmap.clone());
            },
            Some(active) if self.jobs_active == 0 => {
                debug!("add_job_to_active(): copying job {:?} into active base", job.job_id);
                active.copy_from(&job.resmap);
            },
            Some(active) => {
                debug!("add_job_to_active(): merging job {:?} into active row", job.job_id);
                active.or_assign(&job.resmap);
            },
        }

        if view.uses_cpu_array() {
            let job_cpus: &Vec<u16> = job
                .alloc_cpus
                .as_ref()
                .expect("cpu granularity jobs carry an alloc_cpus vector");
            if self.active_cpus.is_none() {
                self.active_cpus = Some(vec![0; view.resmap_size()]);
            }
            let active_cpus: &mut Vec<u16> = self
                .active_cpus
                .as_mut()
                .expect("active cpu vector was just ensured");
            if self.jobs_active == 0 {
                active_cpus.iter_mut().for_each(|slot: &mut u16| *slot = 0);
                for (rank, slot) in job.resmap.iter_set().enumerate() {
                    active_cpus[slot] = job_cpus[rank];
                }
            } else {
                for (rank, slot) in job.resmap.iter_set().enumerate() {
                    let limit: u16 = view.phys_res_cnt(slot);
                    active_cpus[slot] = (active_cpus[slot] + job_cpus[rank]).min(limit);
                }
            }
        }
        self.jobs_active += 1;
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        GsJob,
        GsPart,
        RowState,
        SigState,
    };
    use crate::{
        collections::resmap::ResMap,
        gang::{
            resources::{
                GrType,
                ResourceView,
            },
            ClusterTopology,
        },
    };
    use ::anyhow::Result;

    struct FourCpuNodes;

    impl ClusterTopology for FourCpuNodes {
        fn node_count(&self) -> usize {
            4
        }

        fn cpus(&self, _node: usize, _fast: bool) -> u16 {
            4
        }

        fn sockets(&self, _node: usize, _fast: bool) -> u16 {
            1
        }

        fn cores(&self, _node: usize, _fast: bool) -> u16 {
            4
        }

        fn job_cores(&self, _job_id: u32, _alloc_node_index: usize, _socket_index: usize) -> u16 {
            4
        }
    }

    fn node_view() -> ResourceView {
        ResourceView::new(GrType::Node, false, Box::new(FourCpuNodes))
    }

    fn cpu_view() -> ResourceView {
        ResourceView::new(GrType::Cpu, false, Box::new(FourCpuNodes))
    }

    fn job(job_id: u32, nodes: &[usize], cpus: Option<Vec<u16>>) -> GsJob {
        GsJob {
            job_id,
            sig_state: SigState::Resume,
            row_state: RowState::NoActive,
            resmap: ResMap::from_indices(4, nodes),
            alloc_cpus: cpus,
        }
    }

    #[test]
    fn empty_row_fits_everything() -> Result<()> {
        let view: ResourceView = node_view();
        let part: GsPart = GsPart::new("batch".to_string(), 10);
        crate::ensure_eq!(part.job_fits_in_active_row(&job(1, &[0, 1, 2, 3], None), &view), true);
        Ok(())
    }

    #[test]
    fn node_granularity_rejects_any_overlap() -> Result<()> {
        let view: ResourceView = node_view();
        let mut part: GsPart = GsPart::new("batch".to_string(), 10);
        part.add_job_to_active(&job(1, &[0, 1], None), &view);

        crate::ensure_eq!(part.job_fits_in_active_row(&job(2, &[1, 2], None), &view), false);
        crate::ensure_eq!(part.job_fits_in_active_row(&job(3, &[2, 3], None), &view), true);
        Ok(())
    }

    #[test]
    fn cpu_granularity_shares_a_node_up_to_capacity() -> Result<()> {
        let view: ResourceView = cpu_view();
        let mut part: GsPart = GsPart::new("batch".to_string(), 10);
        part.add_job_to_active(&job(1, &[0], Some(vec![2])), &view);

        // Two more cpus still fit on the 4-cpu node; three do not.
        crate::ensure_eq!(part.job_fits_in_active_row(&job(2, &[0], Some(vec![2])), &view), true);
        crate::ensure_eq!(part.job_fits_in_active_row(&job(3, &[0], Some(vec![3])), &view), false);
        Ok(())
    }

    #[test]
    fn add_job_accumulates_and_clamps_cpus() -> Result<()> {
        let view: ResourceView = cpu_view();
        let mut part: GsPart = GsPart::new("batch".to_string(), 10);
        part.add_job_to_active(&job(1, &[0, 1], Some(vec![3, 3])), &view);
        part.add_job_to_active(&job(2, &[1, 2], Some(vec![3, 1])), &view);

        let active_cpus: &Vec<u16> = part.active_cpus.as_ref().expect("cpu view keeps a cpu vector");
        // Slot 1 clamps at the 4-cpu physical limit (shadow overcommit).
        crate::ensure_eq!(active_cpus, &vec![3, 4, 1, 0]);
        crate::ensure_eq!(part.jobs_active, 2);

        let active: &ResMap = part.active_resmap.as_ref().expect("row has a base map");
        crate::ensure_eq!(active.set_count(), 3);
        Ok(())
    }

    #[test]
    fn zero_admissions_overwrite_the_row() -> Result<()> {
        let view: ResourceView = node_view();
        let mut part: GsPart = GsPart::new("batch".to_string(), 10);
        part.add_job_to_active(&job(1, &[0, 1], None), &view);

        // A rebuild starts from jobs_active == 0 and must not inherit bits.
        part.jobs_active = 0;
        part.add_job_to_active(&job(2, &[3], None), &view);
        let active: &ResMap = part.active_resmap.as_ref().expect("row has a base map");
        crate::ensure_eq!(active.iter_set().collect::<Vec<usize>>(), vec![3]);
        Ok(())
    }
}
