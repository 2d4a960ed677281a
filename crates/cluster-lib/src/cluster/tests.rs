//! Placement and bookkeeping tests
//!
//! Containers use a zero failure probability here so the only state
//! changes are the ones each test makes.

#[cfg(test)]
mod placement_tests {
    use crate::cluster::{
        Cluster, ContainerSimConfig, OverflowPolicy, PlacementConfig, RngFactory,
        SeededRngFactory,
    };
    use crate::error::ClusterError;
    use std::sync::Arc;
    use std::time::Duration;

    fn stable_sim() -> ContainerSimConfig {
        ContainerSimConfig {
            fail_probability: 0.0,
            tick_min: Duration::from_millis(1),
            tick_max: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn cluster_with(overflow: OverflowPolicy, capacities: &[usize]) -> Cluster {
        let rng: Arc<dyn RngFactory> = Arc::new(SeededRngFactory::new(Some(7)));
        let cluster = Cluster::new(stable_sim(), PlacementConfig { overflow }, rng).unwrap();
        for &cap in capacities {
            cluster.add_node(cap).unwrap();
        }
        cluster
    }

    #[tokio::test]
    async fn test_deploy_without_nodes_fails_fast() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[]);
        assert_eq!(cluster.deploy("api").unwrap_err(), ClusterError::NoNodes);
    }

    #[tokio::test]
    async fn test_zero_capacity_node_rejected() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[]);
        assert!(matches!(
            cluster.add_node(0),
            Err(ClusterError::InvalidConfig(_))
        ));
        assert_eq!(cluster.node_count(), 0);
    }

    #[tokio::test]
    async fn test_first_fit_uses_ascending_node_order() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[2, 2, 2]);

        let nodes: Vec<_> = (0..5)
            .map(|_| cluster.deploy("api").unwrap().node_id)
            .collect();

        assert_eq!(nodes, vec![1, 1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn test_first_fit_reuses_freed_slot() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[1, 1]);
        let first = cluster.deploy("api").unwrap();
        cluster.deploy("api").unwrap();

        cluster.evict(first.node_id, first.id).unwrap();
        let next = cluster.deploy("db").unwrap();

        assert_eq!(next.node_id, 1);
    }

    #[tokio::test]
    async fn test_container_ids_strictly_increasing() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[3, 3]);

        let ids: Vec<_> = (0..6).map(|_| cluster.deploy("api").unwrap().id).collect();

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_slots_consistent_after_deploy_and_evict() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[4, 4]);
        let deployed: Vec<_> = (0..6).map(|_| cluster.deploy("api").unwrap()).collect();
        assert!(cluster.slots_consistent());

        for c in deployed.iter().step_by(2) {
            cluster.evict(c.node_id, c.id).unwrap();
            assert!(cluster.slots_consistent());
        }

        assert_eq!(cluster.snapshot(), (3, 8));
        for node_id in 1..=2 {
            let node = cluster.node(node_id).unwrap();
            assert_eq!(node.used_slots, node.containers.len());
        }
    }

    #[tokio::test]
    async fn test_overcommit_picks_least_loaded_node() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[1, 2]);
        for _ in 0..3 {
            cluster.deploy("api").unwrap();
        }

        // Both nodes at 100%: tie goes to the lowest ID
        assert_eq!(cluster.deploy("api").unwrap().node_id, 1);
        // Node 1 at 200%, node 2 at 100%
        assert_eq!(cluster.deploy("api").unwrap().node_id, 2);
        assert_eq!(cluster.snapshot(), (5, 3));
        assert!(cluster.slots_consistent());
    }

    #[tokio::test]
    async fn test_reject_policy_reports_capacity_exhausted() {
        let cluster = cluster_with(OverflowPolicy::Reject, &[1, 2]);
        for _ in 0..3 {
            cluster.deploy("api").unwrap();
        }

        let err = cluster.deploy("api").unwrap_err();
        assert_eq!(
            err,
            ClusterError::CapacityExhausted {
                used: 3,
                capacity: 3
            }
        );
        assert!(err.is_capacity());
        assert_eq!(cluster.snapshot(), (3, 3));
    }

    #[tokio::test]
    async fn test_rejected_deploy_does_not_consume_id() {
        let cluster = cluster_with(OverflowPolicy::Reject, &[1]);
        let first = cluster.deploy("api").unwrap();
        assert!(cluster.deploy("api").is_err());

        cluster.evict(first.node_id, first.id).unwrap();
        assert_eq!(cluster.deploy("api").unwrap().id, first.id + 1);
    }

    #[tokio::test]
    async fn test_deploy_to_full_node_under_reject() {
        let cluster = cluster_with(OverflowPolicy::Reject, &[1, 5]);
        cluster.deploy("api").unwrap();

        assert_eq!(
            cluster.deploy_to(1, "api").unwrap_err(),
            ClusterError::NodeFull {
                node_id: 1,
                capacity: 1
            }
        );
        assert_eq!(cluster.deploy_to(2, "api").unwrap().node_id, 2);
    }

    #[tokio::test]
    async fn test_deploy_to_full_node_overcommits() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[1, 5]);
        cluster.deploy("api").unwrap();

        assert_eq!(cluster.deploy_to(1, "api").unwrap().node_id, 1);
        assert_eq!(cluster.node(1).unwrap().used_slots, 2);
    }

    #[tokio::test]
    async fn test_deploy_to_unknown_node() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[2]);
        assert_eq!(
            cluster.deploy_to(9, "api").unwrap_err(),
            ClusterError::UnknownNode(9)
        );
    }

    #[tokio::test]
    async fn test_snapshot_and_census_are_idempotent() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[10, 10, 10]);
        for i in 0..9 {
            cluster.deploy(["auth", "api", "db"][i % 3]).unwrap();
        }

        assert_eq!(cluster.snapshot(), cluster.snapshot());
        assert_eq!(cluster.snapshot(), (9, 30));

        let census = cluster.census();
        assert_eq!(census.node_count(), 3);
        assert_eq!(census.used_slots, 9);
        assert_eq!(census.capacity, 30);
        assert_eq!(census.running, 9);
        assert_eq!(census.failed, 0);
    }

    #[tokio::test]
    async fn test_fail_container_is_visible_in_census() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[5]);
        let a = cluster.deploy("api").unwrap();
        cluster.deploy("db").unwrap();

        assert!(cluster.fail_container(a.id).unwrap());
        assert!(!cluster.fail_container(a.id).unwrap());

        let census = cluster.census();
        assert_eq!(census.failed, 1);
        assert_eq!(census.running, 1);
        let failed = cluster.failed_containers();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a.id);
        // Failed containers keep their slot until evicted
        assert_eq!(cluster.snapshot(), (2, 5));
    }

    #[tokio::test]
    async fn test_replica_ignores_forced_failure() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[5]);
        let replica = cluster.deploy_replica("db").unwrap();
        assert!(replica.replica);

        assert!(!cluster.fail_container(replica.id).unwrap());
        assert!(cluster.container(replica.id).unwrap().running);
        assert_eq!(cluster.census().replicas, 1);
    }

    #[tokio::test]
    async fn test_unknown_container_errors() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[5]);
        let c = cluster.deploy("api").unwrap();

        assert_eq!(
            cluster.fail_container(42).unwrap_err(),
            ClusterError::UnknownContainer(42)
        );
        assert_eq!(
            cluster.evict(c.node_id, 42).unwrap_err(),
            ClusterError::UnknownContainer(42)
        );
        assert_eq!(
            cluster.evict(7, c.id).unwrap_err(),
            ClusterError::UnknownNode(7)
        );
    }

    #[tokio::test]
    async fn test_locate_follows_back_reference() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[1, 1]);
        cluster.deploy("api").unwrap();
        let second = cluster.deploy("api").unwrap();

        assert_eq!(cluster.locate(second.id), Some(2));
        cluster.evict(2, second.id).unwrap();
        assert_eq!(cluster.locate(second.id), None);
    }

    #[tokio::test]
    async fn test_inject_faults_skips_replicas() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[5, 5]);
        for _ in 0..4 {
            cluster.deploy("api").unwrap();
        }
        let replica = cluster.deploy_replica("api").unwrap();

        let mut rng = SeededRngFactory::new(Some(1)).for_injector();
        let failed = cluster.inject_faults(&mut rng, 1.0);

        assert_eq!(failed, vec![1, 2, 3, 4]);
        assert!(cluster.container(replica.id).unwrap().running);
        assert!(cluster.inject_faults(&mut rng, 1.0).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_joins_container_tasks() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[10]);
        for _ in 0..5 {
            cluster.deploy("api").unwrap();
        }

        assert!(cluster.shutdown(Duration::from_secs(2)).await);
        assert!(cluster.tasks().is_empty());
        assert_eq!(
            cluster.deploy("api").unwrap_err(),
            ClusterError::ShuttingDown
        );
    }

    #[test]
    fn test_deploy_outside_runtime_keeps_ids_gap_free() {
        let cluster = cluster_with(OverflowPolicy::Overcommit, &[4]);
        assert_eq!(cluster.deploy("api").unwrap_err(), ClusterError::NoRuntime);
        assert_eq!(cluster.snapshot(), (0, 4));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let first = cluster.deploy("api").unwrap();
            assert_eq!(first.id, 1);
            assert!(cluster.shutdown(Duration::from_secs(1)).await);
        });
    }
}
