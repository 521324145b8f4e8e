//! pid -> comm and thread-group bookkeeping.

use super::color::color_from_hash;
use crate::event::TraceEvent;
use crate::hash::fnv1a32;
use crate::string_intern::StringPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A process and the threads seen forking from it.
#[derive(Debug, Clone, Default)]
pub struct TgidInfo {
    pub tgid: i32,
    pub pids: Vec<i32>,
    pub hashval: u32,
    pub color: u32,
    /// `comm-tgid`
    pub commstr: Arc<str>,
}

impl TgidInfo {
    fn add_pid(&mut self, pid: i32) {
        if !self.pids.contains(&pid) {
            self.pids.push(pid);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommTracker {
    pub pid_comm: BTreeMap<i32, Arc<str>>,
    /// Names learned from sched_switch, which win over every other source.
    pub sched_switch_comm: HashMap<i32, Arc<str>>,
    pub pid_tgid: HashMap<i32, i32>,
    pub tgids: BTreeMap<i32, TgidInfo>,
}

impl CommTracker {
    pub fn new(pid_comm: BTreeMap<i32, Arc<str>>) -> Self {
        CommTracker {
            pid_comm,
            ..Default::default()
        }
    }

    /// Seeds thread groups from the capture's saved pid -> tgid table. The
    /// group leader goes first in its member list.
    pub fn seed_tgids(&mut self, pid_tgid: &BTreeMap<i32, i32>) {
        for (&pid, &tgid) in pid_tgid {
            if tgid <= 0 {
                continue;
            }
            let info = self.tgids.entry(tgid).or_default();
            info.tgid = tgid;
            if !info.pids.contains(&pid) {
                if pid == tgid {
                    info.pids.insert(0, pid);
                } else {
                    info.pids.push(pid);
                }
            }
            if let Some(comm) = self.pid_comm.get(&pid) {
                info.hashval = info.hashval.wrapping_add(fnv1a32(comm));
            }
            self.pid_tgid.insert(pid, tgid);
        }
    }

    /// Records `prev_comm`/`next_comm`. A pid already named by another
    /// source is only renamed if sched_switch named it before.
    pub fn observe_sched_switch(&mut self, event: &TraceEvent) {
        for (pid_key, comm_key) in [("prev_pid", "prev_comm"), ("next_pid", "next_comm")] {
            let Some(pid) = event.field_i64(pid_key).map(|p| p as i32) else {
                continue;
            };
            let Some(comm) = event.field_arc(comm_key) else {
                continue;
            };
            if pid == 0 {
                continue;
            }
            if !self.pid_comm.contains_key(&pid) || self.sched_switch_comm.contains_key(&pid) {
                self.pid_comm.insert(pid, Arc::clone(comm));
                self.sched_switch_comm.insert(pid, Arc::clone(comm));
            }
        }
    }

    /// `parent_pid` becomes the thread group, `child_pid` a member.
    pub fn add_fork(&mut self, event: &TraceEvent) {
        let tgid = event.field_i64("parent_pid").unwrap_or(0) as i32;
        let pid = event.field_i64("child_pid").unwrap_or(0) as i32;
        let (Some(tgid_comm), Some(child_comm)) = (event.field_arc("parent_comm"), event.field_arc("child_comm")) else {
            return;
        };
        if tgid == 0 || pid == 0 {
            return;
        }

        let info = self.tgids.entry(tgid).or_default();
        if info.tgid == 0 {
            info.tgid = tgid;
            info.hashval = info.hashval.wrapping_add(fnv1a32(tgid_comm));
        }
        info.add_pid(tgid);
        info.add_pid(pid);

        self.pid_comm.entry(tgid).or_insert_with(|| Arc::clone(tgid_comm));
        self.pid_comm.entry(pid).or_insert_with(|| Arc::clone(child_comm));
        self.pid_tgid.entry(tgid).or_insert(tgid);
        self.pid_tgid.entry(pid).or_insert(tgid);
    }

    /// Names the exec'ing pid after the executable, unless it already has a name.
    pub fn on_exec(&mut self, event: &TraceEvent, pool: &mut StringPool) {
        let Some(filename) = event.field("filename") else {
            return;
        };
        if let Some((_, base)) = filename.rsplit_once('/') {
            if !base.is_empty() {
                let base = pool.intern(base);
                self.pid_comm.entry(event.pid).or_insert(base);
            }
        }
    }

    pub fn on_exit(&mut self, event: &TraceEvent) {
        if let Some(comm) = event.field_arc("comm") {
            self.pid_comm.insert(event.pid, Arc::clone(comm));
        }
    }

    /// `comm-pid` for a pid, if the pid has ever been named.
    pub fn comm_str(&self, pid: i32, pool: &mut StringPool) -> Option<Arc<str>> {
        let comm = self.pid_comm.get(&pid)?;
        Some(pool.intern_owned(format!("{}-{}", comm, pid)))
    }

    pub fn sched_switch_comm_str(&self, pid: i32, pool: &mut StringPool) -> Option<Arc<str>> {
        let comm = self.sched_switch_comm.get(&pid)?;
        Some(pool.intern_owned(format!("{}-{}", comm, pid)))
    }

    pub fn tgid_of(&self, pid: i32) -> Option<&TgidInfo> {
        self.pid_tgid.get(&pid).and_then(|tgid| self.tgids.get(tgid))
    }

    /// Drops groups whose only member is the group leader itself.
    pub fn remove_single_tgids(&mut self) -> usize {
        let before = self.tgids.len();
        self.tgids.retain(|_, info| !(info.pids.len() == 1 && info.pids[0] == info.tgid));
        let tgids = &self.tgids;
        self.pid_tgid.retain(|_, tgid| tgids.contains_key(tgid));
        before - self.tgids.len()
    }

    pub fn update_tgid_colors(&mut self, saturation: f32, alpha: f32, pool: &mut StringPool) {
        for info in self.tgids.values_mut() {
            info.color = color_from_hash(info.hashval, saturation, alpha);
            let comm = self.pid_comm.get(&info.tgid).map_or("<...>", |c| &**c);
            info.commstr = pool.intern_owned(format!("{}-{}", comm, info.tgid));
        }
    }
}
