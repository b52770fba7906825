// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::resmap::ResMap,
    gang::{
        partition::{
            GsJob,
            GsPart,
            RowState,
            SigState,
        },
        resources::{
            GrType,
            ResourceView,
        },
        timeslicer::Timeslicer,
        ClusterTopology,
        JobControl,
        JobDescriptor,
        JobState,
        JobTable,
        PartitionConfig,
        PartitionTable,
        SuspendOp,
    },
    runtime::fail::Fail,
};
use ::std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Gang scheduler tunables.
#[derive(Clone, Debug)]
pub struct GangOptions {
    /// Granularity of resource competition.
    pub gr_type: GrType,
    /// Rotation period of the timeslicer.
    pub timeslice: Duration,
    /// Use advertised node counts instead of live ones.
    pub fast_schedule: bool,
}

/// All mutable scheduler state, guarded by one data lock.
///
/// Jobs live in an arena keyed by job id; partitions own ordered id vectors
/// and reference jobs of higher-priority partitions by id as shadows, so no
/// reference can dangle when vectors grow or jobs leave.
pub(crate) struct GangState {
    view: ResourceView,
    jobs: HashMap<u32, GsJob>,
    /// Partitions in configuration order.
    parts: Vec<GsPart>,
    /// Indices into `parts`, sorted by descending priority.
    sorted: Vec<usize>,
    control: Box<dyn JobControl + Send>,
    job_table: Box<dyn JobTable + Send>,
    partition_table: Box<dyn PartitionTable + Send>,
}

/// The gang scheduler.
///
/// One instance per controller process. Public entry points lock the data
/// mutex for their whole run; the timeslicer thread shares the same lock.
pub struct GangScheduler {
    state: Arc<Mutex<GangState>>,
    timeslicer: Timeslicer,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl GangScheduler {
    /// Initializes the scheduler: derives the resource view, builds the
    /// partitions, adopts every job the controller already runs, and spawns
    /// the timeslicer.
    pub fn new(
        options: GangOptions,
        topology: Box<dyn ClusterTopology + Send>,
        control: Box<dyn JobControl + Send>,
        job_table: Box<dyn JobTable + Send>,
        partition_table: Box<dyn PartitionTable + Send>,
    ) -> Result<Self, Fail> {
        crate::runtime::logging::initialize();
        debug!("new(): gang scheduler starting (gr_type={:?})", options.gr_type);
        let view: ResourceView = ResourceView::new(options.gr_type, options.fast_schedule, topology);
        let mut state: GangState = GangState {
            view,
            jobs: HashMap::new(),
            parts: Vec::new(),
            sorted: Vec::new(),
            control,
            job_table,
            partition_table,
        };
        state.build_parts();
        state.scan_job_list();
        let state: Arc<Mutex<GangState>> = Arc::new(Mutex::new(state));
        let timeslicer: Timeslicer = Timeslicer::spawn(state.clone(), options.timeslice)?;
        Ok(Self { state, timeslicer })
    }

    /// A new allocation started. Admits it to its partition or suspends it
    /// on the spot; an admission may shadow-preempt peers elsewhere.
    pub fn job_start(&self, job: &JobDescriptor) {
        debug!("job_start(): job {:?} in partition {:?}", job.job_id, job.partition);
        let mut state = self.lock();
        match state.find_part(&job.partition) {
            Some(pi) => {
                let sig_state: SigState = state.add_job_to_part(pi, job.job_id, &job.node_bitmap);
                if sig_state == SigState::Resume {
                    state.update_all_active_rows();
                }
            },
            None => {
                // No partition means nothing to timeslice against; the job
                // just runs uninterrupted.
                error!(
                    "job_start(): could not find partition {:?} for job {:?}",
                    job.partition, job.job_id
                );
            },
        }
    }

    /// An allocation ended. Its resources may let fillers in elsewhere.
    pub fn job_fini(&self, job: &JobDescriptor) {
        debug!("job_fini(): job {:?}", job.job_id);
        let mut state = self.lock();
        if let Some(pi) = state.find_part(&job.partition) {
            state.remove_job_from_part(job.job_id, pi);
            state.update_all_active_rows();
        }
    }

    /// Reconciles with the authoritative job list: adopts jobs this instance
    /// does not track and releases jobs that completed behind its back.
    pub fn job_scan(&self) {
        debug!("job_scan(): synchronizing with the job table");
        self.lock().scan_job_list();
    }

    /// Rebuilds partition state after a configuration change, preserving the
    /// rotation order of surviving jobs.
    pub fn reconfig(&self) {
        debug!("reconfig(): rebuilding partitions");
        self.lock().reconfig();
    }

    /// Runs one timeslicer rotation immediately.
    pub fn tick(&self) {
        self.lock().tick();
    }

    /// Stops the timeslicer and destroys all partition state. Suspended
    /// jobs stay suspended; the next incarnation's startup scan resumes and
    /// re-adopts them from the authoritative job list.
    pub fn fini(self) {
        debug!("fini(): gang scheduler stopping");
        self.timeslicer.shutdown();
        let mut state = self.lock();
        state.destroy_parts();
    }

    fn lock(&self) -> ::std::sync::MutexGuard<'_, GangState> {
        self.state.lock().expect("gang data lock poisoned")
    }
}

impl GangState {
    /// Rebuilds the partition vector from the external partition list.
    fn build_parts(&mut self) {
        self.parts = self
            .partition_table
            .partitions()
            .into_iter()
            .map(|config: PartitionConfig| GsPart::new(config.name, config.priority))
            .collect();
        self.sorted.clear();
    }

    pub(crate) fn find_part(&self, name: &str) -> Option<usize> {
        self.parts.iter().position(|part: &GsPart| part.name == name)
    }

    /// Issues a suspend or resume through the external control primitive.
    /// Failures are logged and the job skipped; the next pass retries.
    fn signal_job(&self, job_id: u32, op: SuspendOp) {
        debug!("signal_job(): {:?} job {:?}", op, job_id);
        if let Err(e) = self.control.job_suspend(job_id, op) {
            error!("signal_job(): error signaling ({:?}) job {:?}: {:?}", op, job_id, e);
        }
    }

    /// Appends `job_id` as a shadow to every partition with a strictly lower
    /// priority, deduplicating.
    fn cast_shadow(&mut self, job_id: u32, priority: u16) {
        for part in self.parts.iter_mut() {
            if part.priority >= priority {
                continue;
            }
            if !part.shadows.contains(&job_id) {
                part.shadows.push(job_id);
            }
        }
    }

    /// Removes `job_id` from every partition's shadow vector.
    fn clear_shadow(&mut self, job_id: u32) {
        for part in self.parts.iter_mut() {
            part.shadows.retain(|shadow: &u32| *shadow != job_id);
        }
    }

    /// Rebuilds `sorted` as a priority-descending view of the partitions.
    /// The vector is recreated when the partition count changed; otherwise
    /// it is re-sorted in place because priorities may mutate at runtime.
    fn sort_partitions(&mut self) {
        if self.sorted.len() != self.parts.len() {
            self.sorted = (0..self.parts.len()).collect();
        }
        // Exchange sort: partitions are few.
        for j in 0..self.sorted.len() {
            for i in j + 1..self.sorted.len() {
                if self.parts[self.sorted[i]].priority > self.parts[self.sorted[j]].priority {
                    self.sorted.swap(i, j);
                }
            }
        }
    }

    /// Rebuilds one partition's active row while preserving job order:
    /// shadows first, then still-fitting `Active` jobs, then still-fitting
    /// `Filler` jobs; jobs that no longer fit are shadow-preempted. With
    /// `add_new`, previously inactive jobs that now fit are admitted as
    /// fillers and resumed.
    fn update_active_row(&mut self, pi: usize, add_new: bool) {
        self.apply_shadows(pi);
        self.readmit_pass(pi, RowState::Active);
        self.readmit_pass(pi, RowState::Filler);
        if !add_new {
            return;
        }
        for job_id in self.parts[pi].jobs.clone() {
            if self.jobs[&job_id].row_state != RowState::NoActive {
                continue;
            }
            if !self.fits(pi, job_id) {
                continue;
            }
            self.admit(pi, job_id);
            let job: &mut GsJob = self.jobs.get_mut(&job_id).expect("job resides in this partition");
            job.row_state = RowState::Filler;
            if job.sig_state == SigState::Suspend {
                job.sig_state = SigState::Resume;
                self.signal_job(job_id, SuspendOp::Resume);
            }
        }
    }

    /// Resets the admission count and merges every shadow into the row.
    fn apply_shadows(&mut self, pi: usize) {
        let GangState { parts, jobs, view, .. } = self;
        let part: &mut GsPart = &mut parts[pi];
        part.jobs_active = 0;
        for shadow_id in part.shadows.clone() {
            if let Some(shadow_job) = jobs.get(&shadow_id) {
                part.add_job_to_active(shadow_job, view);
            }
        }
    }

    /// Re-admits jobs currently in `want` row state, suspending the ones a
    /// shadow squeezed out.
    fn readmit_pass(&mut self, pi: usize, want: RowState) {
        for job_id in self.parts[pi].jobs.clone() {
            if self.jobs[&job_id].row_state != want {
                continue;
            }
            if self.fits(pi, job_id) {
                self.admit(pi, job_id);
            } else {
                // Preempted by a shadow; keep its place in the rotation.
                if self.jobs[&job_id].sig_state != SigState::Suspend {
                    self.signal_job(job_id, SuspendOp::Suspend);
                    self.jobs.get_mut(&job_id).expect("job resides in this partition").sig_state = SigState::Suspend;
                    self.clear_shadow(job_id);
                }
                self.jobs.get_mut(&job_id).expect("job resides in this partition").row_state = RowState::NoActive;
            }
        }
    }

    fn fits(&self, pi: usize, job_id: u32) -> bool {
        self.parts[pi].job_fits_in_active_row(&self.jobs[&job_id], &self.view)
    }

    /// Merges the job into the row and casts its shadow downward.
    fn admit(&mut self, pi: usize, job_id: u32) {
        let priority: u16 = self.parts[pi].priority;
        {
            let GangState { parts, jobs, view, .. } = self;
            parts[pi].add_job_to_active(&jobs[&job_id], view);
        }
        self.cast_shadow(job_id, priority);
    }

    /// Rebuilds every partition's active row in priority order, so the
    /// shadows of high-priority admissions are in place before lower
    /// partitions are decided.
    pub(crate) fn update_all_active_rows(&mut self) {
        self.sort_partitions();
        for pi in self.sorted.clone() {
            self.update_active_row(pi, true);
        }
    }

    /// Adds a job to a partition and decides its immediate fate: admitted as
    /// a filler, or suspended until a rotation lets it in. Returns the
    /// resulting signal state.
    pub(crate) fn add_job_to_part(&mut self, pi: usize, job_id: u32, node_bitmap: &ResMap) -> SigState {
        debug!("add_job_to_part(): adding job {:?} to {:?}", job_id, self.parts[pi].name);

        // A duplicate means the allocation changed; drop the stale entry.
        if self.parts[pi].jobs.contains(&job_id) {
            debug!("add_job_to_part(): duplicate job {:?} detected", job_id);
            self.remove_job_from_part(job_id, pi);
            self.update_active_row(pi, false);
        }

        let job: GsJob = GsJob {
            job_id,
            sig_state: SigState::Resume,
            row_state: RowState::NoActive,
            resmap: self.view.job_resmap(job_id, node_bitmap),
            alloc_cpus: self.view.alloc_cpus(job_id, node_bitmap),
        };
        self.jobs.insert(job_id, job);
        self.parts[pi].jobs.push(job_id);

        if self.fits(pi, job_id) {
            self.admit(pi, job_id);
            // All jobs arrive running, so no signal is needed.
            self.jobs.get_mut(&job_id).expect("job was just inserted").row_state = RowState::Filler;
            SigState::Resume
        } else {
            debug!("add_job_to_part(): suspending job {:?}", job_id);
            self.signal_job(job_id, SuspendOp::Suspend);
            self.jobs.get_mut(&job_id).expect("job was just inserted").sig_state = SigState::Suspend;
            SigState::Suspend
        }
    }

    /// Removes a job from a partition, clearing any shadow it cast and
    /// resuming it if it was left suspended.
    pub(crate) fn remove_job_from_part(&mut self, job_id: u32, pi: usize) {
        let pos: usize = match self.parts[pi].jobs.iter().position(|id: &u32| *id == job_id) {
            Some(pos) => pos,
            None => return,
        };
        debug!("remove_job_from_part(): removing job {:?} from {:?}", job_id, self.parts[pi].name);
        self.clear_shadow(job_id);
        self.parts[pi].jobs.remove(pos);
        if let Some(job) = self.jobs.remove(&job_id) {
            if job.sig_state == SigState::Suspend {
                debug!("remove_job_from_part(): resuming suspended job {:?}", job_id);
                self.signal_job(job_id, SuspendOp::Resume);
            }
        }
    }

    /// Reconciles with the authoritative job list, then rebuilds all rows.
    pub(crate) fn scan_job_list(&mut self) {
        for desc in self.job_table.jobs() {
            match desc.state {
                JobState::Pending => continue,
                JobState::Running | JobState::Suspended => {
                    let pi: usize = match self.find_part(&desc.partition) {
                        Some(pi) => pi,
                        None => continue,
                    };
                    if self.parts[pi].jobs.contains(&desc.job_id) {
                        continue;
                    }
                    // A previous incarnation may have left the job
                    // suspended; bring it back before adopting it.
                    if desc.state == JobState::Suspended {
                        self.signal_job(desc.job_id, SuspendOp::Resume);
                    }
                    self.add_job_to_part(pi, desc.job_id, &desc.node_bitmap);
                },
                JobState::Completing => {
                    if let Some(pi) = self.find_part(&desc.partition) {
                        self.remove_job_from_part(desc.job_id, pi);
                    }
                },
            }
        }
        self.update_all_active_rows();
    }

    /// Rebuilds partitions from the current partition list, transferring
    /// surviving jobs in rotation order and resuming every job stranded in a
    /// removed partition.
    pub(crate) fn reconfig(&mut self) {
        let old_parts: Vec<GsPart> = ::std::mem::take(&mut self.parts);
        self.build_parts();

        for old_part in &old_parts {
            match self.find_part(&old_part.name) {
                None => {
                    // The partition is gone; let its suspended jobs run.
                    for job_id in &old_part.jobs {
                        let suspended: bool = self
                            .jobs
                            .get(job_id)
                            .map_or(false, |job: &GsJob| job.sig_state == SigState::Suspend);
                        if suspended {
                            self.signal_job(*job_id, SuspendOp::Resume);
                        }
                        self.jobs.remove(job_id);
                    }
                },
                Some(pi) => {
                    // Transfer in stored order to preserve the rotation.
                    for job_id in &old_part.jobs {
                        self.jobs.remove(job_id);
                        let desc: JobDescriptor = match self.job_table.find(*job_id) {
                            Some(desc) => desc,
                            None => continue,
                        };
                        if desc.state == JobState::Suspended {
                            self.signal_job(*job_id, SuspendOp::Resume);
                        }
                        if matches!(desc.state, JobState::Running | JobState::Suspended) {
                            self.add_job_to_part(pi, *job_id, &desc.node_bitmap);
                        }
                    }
                },
            }
        }

        self.scan_job_list();
    }

    /// One timeslicer pass: sort partitions, then rotate every partition
    /// that has jobs (or shadows) waiting outside its active row.
    pub(crate) fn tick(&mut self) {
        self.sort_partitions();
        for pi in self.sorted.clone() {
            let part: &GsPart = &self.parts[pi];
            trace!(
                "tick(): part {:?}: run {:?} total {:?}",
                part.name,
                part.jobs_active,
                part.jobs.len()
            );
            if (part.jobs_active as usize) < part.jobs.len() + part.shadows.len() {
                self.cycle_job_list(pi);
            }
        }
    }

    /// Rotates one partition: every `Active` job moves to the tail (keeping
    /// the relative order of the rest), the row is rebuilt from the new
    /// front, and signals are issued for the jobs whose admission flipped.
    fn cycle_job_list(&mut self, pi: usize) {
        {
            let GangState { parts, jobs, .. } = self;
            let part: &mut GsPart = &mut parts[pi];
            for i in 0..part.jobs.len() {
                loop {
                    let job_id: u32 = part.jobs[i];
                    let job: &mut GsJob = jobs.get_mut(&job_id).expect("job resides in this partition");
                    if job.row_state != RowState::Active {
                        break;
                    }
                    // Move to the back row and de-activate.
                    job.row_state = RowState::NoActive;
                    part.jobs.remove(i);
                    part.jobs.push(job_id);
                }
                let job: &mut GsJob = jobs.get_mut(&part.jobs[i]).expect("job resides in this partition");
                if job.row_state == RowState::Filler {
                    job.row_state = RowState::NoActive;
                }
            }
        }

        self.build_active_row(pi);

        // Suspend running jobs that fell out of the row...
        for job_id in self.parts[pi].jobs.clone() {
            let job: &GsJob = &self.jobs[&job_id];
            if job.row_state == RowState::NoActive && job.sig_state == SigState::Resume {
                self.signal_job(job_id, SuspendOp::Suspend);
                self.jobs.get_mut(&job_id).expect("job resides in this partition").sig_state = SigState::Suspend;
                self.clear_shadow(job_id);
            }
        }
        // ...and resume suspended jobs that made it in.
        for job_id in self.parts[pi].jobs.clone() {
            let job: &GsJob = &self.jobs[&job_id];
            if job.row_state == RowState::Active && job.sig_state == SigState::Suspend {
                self.signal_job(job_id, SuspendOp::Resume);
                self.jobs.get_mut(&job_id).expect("job resides in this partition").sig_state = SigState::Resume;
                let priority: u16 = self.parts[pi].priority;
                self.cast_shadow(job_id, priority);
            }
        }
    }

    /// Builds the active row from scratch in stored job order: shadows
    /// first, then any job that fits, marked `Active`.
    fn build_active_row(&mut self, pi: usize) {
        self.parts[pi].jobs_active = 0;
        if self.parts[pi].jobs.is_empty() {
            return;
        }
        self.apply_shadows(pi);
        for job_id in self.parts[pi].jobs.clone() {
            if self.fits(pi, job_id) {
                self.admit(pi, job_id);
                self.jobs.get_mut(&job_id).expect("job resides in this partition").row_state = RowState::Active;
            }
        }
    }

    /// Drops all partition and job state on final teardown.
    fn destroy_parts(&mut self) {
        self.parts.clear();
        self.sorted.clear();
        self.jobs.clear();
    }

    #[cfg(test)]
    pub(crate) fn job(&self, job_id: u32) -> Option<&GsJob> {
        self.jobs.get(&job_id)
    }

    #[cfg(test)]
    pub(crate) fn part(&self, name: &str) -> Option<&GsPart> {
        self.find_part(name).map(|pi: usize| &self.parts[pi])
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
