//! Launch ordering: every job comes after the jobs it depends on.
//!
//! Ordering is a topological sort that always emits the earliest remaining
//! job (by input position) whose in-set dependencies have been emitted.
//! Unrelated jobs therefore keep their input order. When only jobs on a
//! cycle remain, the earliest of them is emitted anyway and the sort carries
//! on, so a malformed graph still yields a complete, deterministic order.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use crate::types::{Job, JobId};

pub fn order_by_dependencies(jobs: Vec<Job>) -> Vec<Job> {
    let position: HashMap<JobId, usize> =
        jobs.iter().enumerate().map(|(i, j)| (j.id, i)).collect();

    // dependents[i] lists the positions that wait on position i.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];
    let mut pending: Vec<usize> = vec![0; jobs.len()];
    for (i, job) in jobs.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for dep in job.dependency_ids() {
            match position.get(&dep) {
                Some(&d) if d != i && seen.insert(d) => {
                    dependents[d].push(i);
                    pending[i] += 1;
                }
                _ => {}
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..jobs.len()).filter(|&i| pending[i] == 0).collect();
    let mut emitted = vec![false; jobs.len()];
    let mut order = Vec::with_capacity(jobs.len());

    while order.len() < jobs.len() {
        let next = match ready.pop_first() {
            Some(i) => i,
            None => {
                // Only cyclic jobs are left: break the cycle at the earliest one.
                let Some(i) = (0..jobs.len()).find(|&i| !emitted[i]) else {
                    break;
                };
                warn!(job_id = jobs[i].id, "dependency cycle; launching in input order");
                i
            }
        };
        if emitted[next] {
            continue;
        }
        emitted[next] = true;
        order.push(next);
        for &d in &dependents[next] {
            if pending[d] > 0 {
                pending[d] -= 1;
                if pending[d] == 0 && !emitted[d] {
                    ready.insert(d);
                }
            }
        }
    }

    let mut slots: Vec<Option<Job>> = jobs.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{sample_job, JobDependency};

    fn job(id: JobId, deps: &[JobId]) -> Job {
        let mut j = sample_job(id);
        j.dependencies = deps.iter().map(|&d| JobDependency::on(d)).collect();
        j
    }

    fn ids(jobs: &[Job]) -> Vec<JobId> {
        jobs.iter().map(|j| j.id).collect()
    }

    fn assert_dependencies_first(ordered: &[Job]) {
        for (i, j) in ordered.iter().enumerate() {
            for dep in j.dependency_ids() {
                if let Some(p) = ordered.iter().position(|o| o.id == dep) {
                    assert!(p < i, "job {} placed before its dependency {dep}", j.id);
                }
            }
        }
    }

    #[test]
    fn dependency_precedes_dependent() {
        // job 3 depends on job 1; job 2 is unconstrained.
        let ordered = order_by_dependencies(vec![job(3, &[1]), job(1, &[]), job(2, &[])]);
        assert_dependencies_first(&ordered);
        assert_eq!(ids(&ordered), vec![1, 3, 2]);
    }

    #[test]
    fn unrelated_jobs_keep_input_order() {
        let ordered = order_by_dependencies(vec![job(5, &[]), job(2, &[]), job(9, &[])]);
        assert_eq!(ids(&ordered), vec![5, 2, 9]);
    }

    #[test]
    fn long_chain_given_backwards() {
        let input: Vec<Job> = (1..=6).rev().map(|i| job(i, &[i - 1])).collect();
        let ordered = order_by_dependencies(input);
        assert_eq!(ids(&ordered), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn diamond_respects_every_edge() {
        let ordered = order_by_dependencies(vec![
            job(4, &[2, 3]),
            job(3, &[1]),
            job(2, &[1]),
            job(1, &[]),
        ]);
        assert_dependencies_first(&ordered);
        assert_eq!(ids(&ordered), vec![1, 3, 2, 4]);
    }

    #[test]
    fn dependencies_outside_the_set_are_ignored() {
        let ordered = order_by_dependencies(vec![job(2, &[99]), job(1, &[])]);
        assert_eq!(ids(&ordered), vec![2, 1]);
    }

    #[test]
    fn cycle_degrades_to_input_order_without_hanging() {
        let input = vec![job(1, &[2]), job(2, &[1]), job(3, &[]), job(4, &[1])];
        let ordered = order_by_dependencies(input.clone());
        assert_eq!(ordered.len(), 4);
        // Cycle broken at job 1; job 4 still follows its dependency.
        assert_eq!(ids(&ordered), vec![3, 1, 2, 4]);
        // deterministic
        assert_eq!(ids(&order_by_dependencies(input)), ids(&ordered));
    }

    #[test]
    fn self_and_duplicate_edges_are_harmless() {
        let mut twice = job(2, &[1, 1]);
        twice.dependencies.push(JobDependency::on(2));
        let ordered = order_by_dependencies(vec![twice, job(1, &[])]);
        assert_eq!(ids(&ordered), vec![1, 2]);
    }

    #[test]
    fn empty_input() {
        assert!(order_by_dependencies(Vec::new()).is_empty());
    }
}
