//! End-to-end scheduling scenarios against the in-process stack: enqueue,
//! tick, and observe row state, occupancy, and counters.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use gridmesh_common::{
    AccessKey, AgentId, ClusterMode, ClusterRole, ResourceSlot, SessionId, SessionType,
    SlotName, SlotTypeRegistry, SlotTypes,
};
use gridmesh_manager::error::{Result, SchedulingError};
use gridmesh_manager::models::{
    AgentRow, AgentStatus, DomainRow, KernelRow, KernelStatus, KeyPairResourcePolicy,
    KeyPairRow, ResourceGroupRow, SessionRow, SessionStatus,
};
use gridmesh_manager::sched::{
    AgentAllocationContext, AgentClient, KernelCreationResult,
};
use gridmesh_manager::statestore::keypair_concurrency_key;
use gridmesh_manager::{
    AgentRegistry, EchoAgentClient, EventProducer, LocalLockFactory, ManagerConfig,
    ScheduleRepository, SchedulerDispatcher, StateStore,
};
use rust_decimal::Decimal;
use std::sync::Arc;

struct TestCluster {
    repository: Arc<ScheduleRepository>,
    state: Arc<StateStore>,
    registry: Arc<AgentRegistry>,
    dispatcher: SchedulerDispatcher,
}

fn slots(pairs: &[(&str, &str)]) -> ResourceSlot {
    pairs
        .iter()
        .map(|(k, v)| (SlotName::new(*k), v.parse::<Decimal>().unwrap()))
        .collect()
}

async fn cluster_with(agent_client: Arc<dyn AgentClient>) -> TestCluster {
    let repository = Arc::new(ScheduleRepository::new());
    let state = Arc::new(StateStore::new());
    let events = EventProducer::default();
    let slot_types = Arc::new(SlotTypeRegistry::with_intrinsic());
    slot_types
        .add(SlotName::new("cuda.shares"), SlotTypes::Count)
        .unwrap();
    let registry = Arc::new(AgentRegistry::new(
        repository.clone(),
        state.clone(),
        events,
        slot_types,
    ));
    let dispatcher = SchedulerDispatcher::new(
        registry.clone(),
        Arc::new(LocalLockFactory::new()),
        agent_client,
        ManagerConfig::default(),
    );

    repository
        .upsert_resource_group(ResourceGroupRow::new("default", "fifo"))
        .await;
    repository
        .upsert_policy(KeyPairResourcePolicy::default())
        .await;
    repository
        .upsert_keypair(KeyPairRow {
            access_key: AccessKey::new("ak-one"),
            user_id: "user-one".to_owned(),
            resource_policy: "default".to_owned(),
        })
        .await;

    TestCluster {
        repository,
        state,
        registry,
        dispatcher,
    }
}

async fn cluster() -> TestCluster {
    cluster_with(Arc::new(EchoAgentClient)).await
}

async fn add_agent(cluster: &TestCluster, id: &str, capacity: &[(&str, &str)]) {
    cluster
        .repository
        .upsert_agent(AgentRow {
            id: AgentId::new(id),
            addr: format!("tcp://{id}:6001"),
            architecture: "x86_64".to_owned(),
            resource_group: "default".to_owned(),
            status: AgentStatus::Alive,
            available_slots: slots(capacity),
            occupied_slots: ResourceSlot::new(),
            version: "24.03".to_owned(),
            compute_plugins: Default::default(),
            first_contact: Utc::now(),
            last_heartbeat: Utc::now(),
        })
        .await;
}

fn session_row(name: &str, requested: ResourceSlot, cluster_mode: ClusterMode) -> SessionRow {
    SessionRow {
        id: SessionId::generate(),
        creation_id: format!("creation-{name}"),
        name: name.to_owned(),
        session_type: SessionType::Interactive,
        cluster_mode,
        cluster_size: 1,
        priority: 0,
        access_key: AccessKey::new("ak-one"),
        user_id: "user-one".to_owned(),
        domain_name: "default".to_owned(),
        group_id: "default".to_owned(),
        resource_group: "default".to_owned(),
        requested_slots: requested,
        occupying_slots: ResourceSlot::new(),
        vfolder_mounts: Vec::new(),
        environ: Default::default(),
        status: SessionStatus::Pending,
        status_info: None,
        status_data: serde_json::json!({}),
        status_history: serde_json::json!({}),
        starts_at: None,
        created_at: Utc::now(),
        terminated_at: None,
        dependencies: Vec::new(),
        designated_agent: None,
        agent_ids: Vec::new(),
        endpoint_id: None,
    }
}

fn kernel_for(session: &SessionRow, idx: u32, requested: ResourceSlot) -> KernelRow {
    KernelRow::new(
        session.id,
        session.access_key.clone(),
        if idx == 0 {
            ClusterRole::Main
        } else {
            ClusterRole::Sub
        },
        idx,
        "x86_64",
        "python:3.11",
        requested,
        "default",
    )
}

async fn enqueue_single(cluster: &TestCluster, name: &str, cpu: &str) -> SessionId {
    let requested = slots(&[("cpu", cpu)]);
    let session = session_row(name, requested.clone(), ClusterMode::SingleNode);
    let kernel = kernel_for(&session, 0, requested);
    cluster
        .repository
        .enqueue_session(session, vec![kernel])
        .await
        .unwrap()
}

#[tokio::test]
async fn single_node_session_reaches_running_with_settled_occupancy() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "8"), ("mem", "64")]).await;
    let session_id = enqueue_single(&cluster, "train", "2").await;

    cluster.dispatcher.schedule("test").await.unwrap();
    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Scheduled);
    assert_eq!(session.agent_ids, vec![AgentId::new("a0")]);
    let (_, occupied) = cluster
        .repository
        .agent_slots(&AgentId::new("a0"))
        .await
        .unwrap();
    assert_eq!(occupied.get(&SlotName::new("cpu")), Decimal::from(2));

    cluster.dispatcher.check_precond("test").await.unwrap();
    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Preparing);

    // Image pull completion is reported by external events; emulate it.
    for kernel in cluster.repository.kernels_of_session(session_id).await {
        cluster
            .repository
            .transit_kernel_status(kernel.id, KernelStatus::Prepared, None)
            .await
            .unwrap();
    }

    cluster.dispatcher.start("test").await.unwrap();
    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    let kernels = cluster.repository.kernels_of_session(session_id).await;
    assert!(kernels[0].container_id.is_some());
    let (_, occupied) = cluster
        .repository
        .agent_slots(&AgentId::new("a0"))
        .await
        .unwrap();
    assert_eq!(occupied.get(&SlotName::new("cpu")), Decimal::from(2));
}

#[tokio::test]
async fn concurrency_cap_keeps_the_second_session_pending() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "8"), ("mem", "64")]).await;
    cluster
        .repository
        .upsert_policy(KeyPairResourcePolicy {
            max_concurrent_sessions: 1,
            ..Default::default()
        })
        .await;
    let first = enqueue_single(&cluster, "one", "1").await;
    let second = enqueue_single(&cluster, "two", "1").await;

    cluster.dispatcher.schedule("test").await.unwrap();
    assert_eq!(
        cluster.repository.get_session(first).await.unwrap().status,
        SessionStatus::Scheduled
    );
    let blocked = cluster.repository.get_session(second).await.unwrap();
    assert_eq!(blocked.status, SessionStatus::Pending);
    assert_eq!(
        blocked.status_info.as_deref(),
        Some("predicate-checks-failed")
    );
    assert_eq!(
        cluster
            .state
            .get_counter(&keypair_concurrency_key(&AccessKey::new("ak-one"))),
        1
    );
}

#[tokio::test]
async fn failed_quota_predicate_rolls_back_the_concurrency_increment() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "8"), ("mem", "64")]).await;
    cluster
        .repository
        .upsert_domain(DomainRow {
            name: "default".to_owned(),
            total_resource_slots: Some(
                [(SlotName::new("cpu"), Decimal::from(1))].into_iter().collect(),
            ),
        })
        .await;
    let session_id = enqueue_single(&cluster, "big", "2").await;

    cluster.dispatcher.schedule("test").await.unwrap();
    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(session.scheduler_retries(), 1);
    // The concurrency predicate incremented first; the failed domain check
    // must leave the counter where it started.
    assert_eq!(
        cluster
            .state
            .get_counter(&keypair_concurrency_key(&AccessKey::new("ak-one"))),
        0
    );
    let failed = session
        .status_data
        .pointer("/scheduler/failed_predicates")
        .unwrap()
        .as_array()
        .unwrap();
    assert!(failed
        .iter()
        .any(|f| f["name"] == "domain_resource_limit"));
}

#[tokio::test]
async fn multi_node_partial_failure_rolls_back_all_reservations() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "4"), ("mem", "64")]).await;
    add_agent(&cluster, "a1", &[("cpu", "4"), ("mem", "64")]).await;

    let per_kernel = slots(&[("cpu", "3")]);
    let mut session = session_row("dist", slots(&[("cpu", "9")]), ClusterMode::MultiNode);
    session.cluster_size = 3;
    let kernels = (0..3)
        .map(|idx| kernel_for(&session, idx, per_kernel.clone()))
        .collect();
    let session_id = cluster
        .repository
        .enqueue_session(session, kernels)
        .await
        .unwrap();

    cluster.dispatcher.schedule("test").await.unwrap();

    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(
        session.status_info.as_deref(),
        Some("no-available-instances")
    );
    for agent in ["a0", "a1"] {
        let (_, occupied) = cluster
            .repository
            .agent_slots(&AgentId::new(agent))
            .await
            .unwrap();
        assert_eq!(occupied.get(&SlotName::new("cpu")), Decimal::ZERO);
    }
}

#[tokio::test]
async fn pending_timeout_cancels_stale_sessions() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "8"), ("mem", "64")]).await;
    let mut group = ResourceGroupRow::new("default", "fifo");
    group.opts.pending_timeout_secs = 60;
    cluster.repository.upsert_resource_group(group).await;

    let requested = slots(&[("cpu", "1")]);
    let mut session = session_row("stale", requested.clone(), ClusterMode::SingleNode);
    session.created_at = Utc::now() - ChronoDuration::seconds(61);
    let kernel = kernel_for(&session, 0, requested);
    let session_id = cluster
        .repository
        .enqueue_session(session, vec![kernel])
        .await
        .unwrap();

    cluster.dispatcher.schedule("test").await.unwrap();
    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(session.status_info.as_deref(), Some("pending-timeout"));
    let kernels = cluster.repository.kernels_of_session(session_id).await;
    assert_eq!(kernels[0].status, KernelStatus::Cancelled);
}

#[tokio::test]
async fn insufficient_capacity_keeps_the_session_pending_for_retry() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "2"), ("mem", "64")]).await;
    let session_id = enqueue_single(&cluster, "hungry", "4").await;

    cluster.dispatcher.schedule("test").await.unwrap();
    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(
        session.status_info.as_deref(),
        Some("no-available-instances")
    );

    // Capacity arrives; the next tick picks the session up.
    add_agent(&cluster, "a1", &[("cpu", "8"), ("mem", "64")]).await;
    cluster.dispatcher.schedule("test").await.unwrap();
    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Scheduled);
    assert_eq!(session.agent_ids, vec![AgentId::new("a1")]);
}

#[tokio::test]
async fn recalc_is_idempotent_and_repairs_drift() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "8"), ("mem", "64")]).await;
    let session_id = enqueue_single(&cluster, "steady", "2").await;
    cluster.dispatcher.schedule("test").await.unwrap();

    cluster.registry.recalc_resource_usage(true).await.unwrap();
    let after_first = cluster.repository.agents_snapshot().await;
    cluster.registry.recalc_resource_usage(true).await.unwrap();
    let after_second = cluster.repository.agents_snapshot().await;
    assert_eq!(
        serde_json::to_value(&after_first).unwrap(),
        serde_json::to_value(&after_second).unwrap()
    );

    // Corrupt the agent row, then let the fullscan repair it.
    cluster
        .repository
        .set_agent_occupied(&AgentId::new("a0"), slots(&[("cpu", "7")]))
        .await
        .unwrap();
    cluster.registry.recalc_resource_usage(true).await.unwrap();
    let (_, occupied) = cluster
        .repository
        .agent_slots(&AgentId::new("a0"))
        .await
        .unwrap();
    assert_eq!(occupied.get(&SlotName::new("cpu")), Decimal::from(2));
    let _ = session_id;
}

struct FailingAgentClient;

#[async_trait]
impl AgentClient for FailingAgentClient {
    async fn check_and_pull_image(
        &self,
        _agent: &AgentAllocationContext,
        _image: &str,
        _architecture: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn create_kernels(
        &self,
        _agent: &AgentAllocationContext,
        _session_id: SessionId,
        _kernels: &[KernelRow],
    ) -> Result<Vec<KernelCreationResult>> {
        Err(SchedulingError::agent("container runtime exploded"))
    }

    async fn destroy_kernel(
        &self,
        _agent: &AgentAllocationContext,
        _kernel_id: gridmesh_common::KernelId,
        _reason: &str,
    ) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn creation_failure_cancels_the_session_and_releases_resources() {
    let cluster = cluster_with(Arc::new(FailingAgentClient)).await;
    add_agent(&cluster, "a0", &[("cpu", "8"), ("mem", "64")]).await;
    let session_id = enqueue_single(&cluster, "doomed", "2").await;

    cluster.dispatcher.schedule("test").await.unwrap();
    cluster.dispatcher.check_precond("test").await.unwrap();
    for kernel in cluster.repository.kernels_of_session(session_id).await {
        cluster
            .repository
            .transit_kernel_status(kernel.id, KernelStatus::Prepared, None)
            .await
            .unwrap();
    }
    cluster.dispatcher.start("test").await.unwrap();

    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(session.status_info.as_deref(), Some("failed-to-start"));
    let (_, occupied) = cluster
        .repository
        .agent_slots(&AgentId::new("a0"))
        .await
        .unwrap();
    assert_eq!(occupied.get(&SlotName::new("cpu")), Decimal::ZERO);
}

#[tokio::test]
async fn fifo_schedules_in_arrival_order() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "8"), ("mem", "64")]).await;
    let mut ids = Vec::new();
    for (name, age) in [("first", 30), ("second", 20), ("third", 10)] {
        let requested = slots(&[("cpu", "1")]);
        let mut session = session_row(name, requested.clone(), ClusterMode::SingleNode);
        session.created_at = Utc::now() - ChronoDuration::seconds(age);
        let kernel = kernel_for(&session, 0, requested);
        ids.push(
            cluster
                .repository
                .enqueue_session(session, vec![kernel])
                .await
                .unwrap(),
        );
    }
    cluster.dispatcher.schedule("test").await.unwrap();
    for id in ids {
        assert_eq!(
            cluster.repository.get_session(id).await.unwrap().status,
            SessionStatus::Scheduled
        );
    }
    let (_, occupied) = cluster
        .repository
        .agent_slots(&AgentId::new("a0"))
        .await
        .unwrap();
    assert_eq!(occupied.get(&SlotName::new("cpu")), Decimal::from(3));
}

#[tokio::test]
async fn cancelling_a_scheduled_session_releases_its_reservation() {
    let cluster = cluster().await;
    add_agent(&cluster, "a0", &[("cpu", "8"), ("mem", "64")]).await;
    let session_id = enqueue_single(&cluster, "doomed", "2").await;
    cluster.dispatcher.schedule("test").await.unwrap();

    cluster
        .dispatcher
        .cancel_session(session_id, "user-requested")
        .await
        .unwrap();
    let session = cluster.repository.get_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    let (_, occupied) = cluster
        .repository
        .agent_slots(&AgentId::new("a0"))
        .await
        .unwrap();
    assert_eq!(occupied.get(&SlotName::new("cpu")), Decimal::ZERO);

    // Cancelling again is rejected: the session is already terminal.
    assert!(cluster
        .dispatcher
        .cancel_session(session_id, "user-requested")
        .await
        .is_err());
}

#[tokio::test]
async fn heartbeats_create_and_revive_agents() {
    let cluster = cluster().await;
    let heartbeat = gridmesh_agent::AgentHeartbeat {
        agent_id: AgentId::new("hb-agent"),
        addr: "tcp://hb-agent:6001".to_owned(),
        architecture: "aarch64".to_owned(),
        resource_group: "default".to_owned(),
        version: "24.03".to_owned(),
        available_slots: slots(&[("cpu", "4"), ("mem", "16")]),
        slot_types: [(SlotName::new("cpu"), SlotTypes::Count)].into_iter().collect(),
        compute_plugins: Default::default(),
        devices: Vec::new(),
        device_slots: Default::default(),
        containers: Vec::new(),
    };
    cluster.registry.handle_heartbeat(&heartbeat).await.unwrap();
    let agent = cluster
        .repository
        .get_agent(&AgentId::new("hb-agent"))
        .await
        .unwrap();
    assert_eq!(agent.status, AgentStatus::Alive);
    assert_eq!(agent.architecture, "aarch64");

    // Silence past the liveness threshold marks the agent LOST...
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let lost = cluster
        .registry
        .sweep_lost_agents(std::time::Duration::from_millis(5))
        .await
        .unwrap();
    assert_eq!(lost, vec![AgentId::new("hb-agent")]);

    // ...and the next heartbeat revives it.
    cluster.registry.handle_heartbeat(&heartbeat).await.unwrap();
    let agent = cluster
        .repository
        .get_agent(&AgentId::new("hb-agent"))
        .await
        .unwrap();
    assert_eq!(agent.status, AgentStatus::Alive);
}

fn cpu_resource_spec(cores: &[&str]) -> gridmesh_agent::KernelResourceSpec {
    use gridmesh_common::{DeviceId, DeviceName};
    use std::collections::BTreeMap;

    let cpu_alloc: BTreeMap<DeviceId, Decimal> = cores
        .iter()
        .map(|core| (DeviceId::new(*core), Decimal::ONE))
        .collect();
    let mut allocations: BTreeMap<DeviceName, _> = BTreeMap::new();
    allocations
        .entry(DeviceName::new("cpu"))
        .or_insert_with(BTreeMap::new)
        .insert(SlotName::new("cpu"), cpu_alloc);
    gridmesh_agent::KernelResourceSpec {
        slots: slots(&[("cpu", &cores.len().to_string())]),
        allocations,
        scratch_disk_size: 0,
        mounts: Vec::new(),
        unified_devices: Vec::new(),
    }
}

#[tokio::test]
async fn heartbeats_rebuild_alloc_maps_from_container_resource_specs() {
    use gridmesh_agent::{ContainerReport, DeviceSlotInfo};
    use gridmesh_common::{DeviceId, KernelId};
    use std::collections::BTreeMap;

    let cluster = cluster().await;
    let device_slots: BTreeMap<DeviceId, DeviceSlotInfo> = (0..4)
        .map(|core| {
            (
                DeviceId::new(core.to_string()),
                DeviceSlotInfo {
                    slot_type: SlotTypes::Count,
                    slot_name: SlotName::new("cpu"),
                    capacity: Decimal::ONE,
                },
            )
        })
        .collect();

    let heartbeat = gridmesh_agent::AgentHeartbeat {
        agent_id: AgentId::new("restarting-agent"),
        addr: "tcp://restarting-agent:6001".to_owned(),
        architecture: "x86_64".to_owned(),
        resource_group: "default".to_owned(),
        version: "24.03".to_owned(),
        available_slots: slots(&[("cpu", "4")]),
        slot_types: [(SlotName::new("cpu"), SlotTypes::Count)].into_iter().collect(),
        compute_plugins: Default::default(),
        devices: Vec::new(),
        device_slots,
        containers: vec![ContainerReport {
            kernel_id: KernelId::generate(),
            container_id: "container-1".to_owned(),
            resource_spec: cpu_resource_spec(&["0", "1"]),
        }],
    };

    cluster.registry.handle_heartbeat(&heartbeat).await.unwrap();
    let rebuilt = cluster
        .registry
        .agent_device_allocations(&AgentId::new("restarting-agent"))
        .await
        .unwrap();
    let cells = &rebuilt[&SlotName::new("cpu")];
    assert_eq!(cells[&DeviceId::new("0")], Decimal::ONE);
    assert_eq!(cells[&DeviceId::new("1")], Decimal::ONE);
    assert_eq!(cells[&DeviceId::new("2")], Decimal::ZERO);

    // A kernel re-driven through preparation replays exactly once, even if
    // the replay request repeats.
    let recovered = KernelId::generate();
    let spec = cpu_resource_spec(&["2"]);
    for _ in 0..2 {
        cluster
            .registry
            .replay_kernel_allocation(&AgentId::new("restarting-agent"), recovered, &spec)
            .await
            .unwrap();
    }
    let rebuilt = cluster
        .registry
        .agent_device_allocations(&AgentId::new("restarting-agent"))
        .await
        .unwrap();
    assert_eq!(rebuilt[&SlotName::new("cpu")][&DeviceId::new("2")], Decimal::ONE);

    // The next heartbeat replaces the map wholesale: only the containers it
    // reports (plus persisted kernel rows) survive.
    cluster.registry.handle_heartbeat(&heartbeat).await.unwrap();
    let rebuilt = cluster
        .registry
        .agent_device_allocations(&AgentId::new("restarting-agent"))
        .await
        .unwrap();
    assert_eq!(rebuilt[&SlotName::new("cpu")][&DeviceId::new("2")], Decimal::ZERO);
}
