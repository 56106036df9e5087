//! Unit tests for MicrovmMachine reconciliation

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::placement::PlacementStrategy;
    use crate::reconciler::REQUEUE_PERIOD;
    use crate::test_utils::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use crds::*;
    use kube_runtime::controller::Action;
    use microvm_client::{MicroVmState, MockOperation, TlsConfig};

    fn stored_machine(store: &MemoryStore) -> Option<MicrovmMachine> {
        store.get::<MicrovmMachine>(NAMESPACE, "worker-0")
    }

    fn machine_status(store: &MemoryStore) -> MicrovmMachineStatus {
        stored_machine(store).unwrap().status.unwrap_or_default()
    }

    fn microvm_ready_condition(store: &MemoryStore) -> Condition {
        get_condition(&machine_status(store).conditions, MICROVM_READY_CONDITION)
            .cloned()
            .unwrap()
    }

    /// Stores `worker-0` with a finalizer, a provider id on `host` and a deletion timestamp
    fn seed_deleting_worker(store: &MemoryStore, host: &str) {
        let mut machine = create_test_microvm_machine("worker-0", NAMESPACE, CLUSTER, "worker-0");
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        machine.spec.provider_id = Some(format_provider_id(host, "uid-1"));
        mark_deleting(&mut machine.metadata);
        store.insert(&machine);
    }

    #[tokio::test]
    async fn test_create_then_ready_scenario() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);

        // First pass: nothing exists, the microvm is created and pending.
        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_PERIOD));
        assert_eq!(env.client.get_calls(), 1);
        assert_eq!(env.client.create_calls(), 1);

        let machine = stored_machine(&env.store).unwrap();
        assert_eq!(machine.spec.provider_id.as_deref(), Some("microvm://host1:9090/uid-1"));
        assert_eq!(
            machine.metadata.finalizers,
            Some(vec![MACHINE_FINALIZER.to_string()])
        );
        let status = machine.status.unwrap();
        assert!(!status.ready);
        assert_eq!(status.vm_state, Some(VmState::Pending));
        let condition = get_condition(&status.conditions, MICROVM_READY_CONDITION).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason.as_deref(), Some(MICROVM_PENDING_REASON));
        assert_eq!(condition.severity, Some(ConditionSeverity::Info));

        // Second pass: the service reports the microvm created.
        env.client.set_state(NAMESPACE, "worker-0", MicroVmState::Created);
        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(default_settings().resync_period));

        let status = machine_status(&env.store);
        assert!(status.ready);
        assert_eq!(status.vm_state, Some(VmState::Running));
        assert!(is_true(&status.conditions, MICROVM_READY_CONDITION));
        assert!(is_true(&status.conditions, READY_CONDITION));
        assert_eq!(env.client.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_ready_machine_is_idempotent() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.client.set_create_state(MicroVmState::Created);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        let provider_id = stored_machine(&env.store).unwrap().spec.provider_id;
        let writes = env.store.patches().len();

        for _ in 0..3 {
            reconciler
                .reconcile_microvm_machine(NAMESPACE, "worker-0")
                .await
                .unwrap();
        }

        assert_eq!(env.client.create_calls(), 1);
        assert_eq!(env.client.delete_calls(), 0);
        assert_eq!(stored_machine(&env.store).unwrap().spec.provider_id, provider_id);
        assert_eq!(env.store.patches().len(), writes, "steady state must not write");
    }

    #[tokio::test]
    async fn test_created_microvm_carries_bootstrap_metadata() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.store.insert_secret(
            NAMESPACE,
            BOOTSTRAP_SECRET,
            &[("value", b"provider: PROVIDER_ID\n".as_slice())],
        );

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();

        let specs = env.client.created_specs();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.id, "worker-0");
        assert_eq!(spec.namespace, NAMESPACE);

        // The provider id is unknown before the create call, so nothing is substituted.
        let user_data = STANDARD.decode(&spec.metadata["user-data"]).unwrap();
        assert_eq!(user_data, b"provider: PROVIDER_ID\n");

        let vendor_data =
            String::from_utf8(STANDARD.decode(&spec.metadata["vendor-data"]).unwrap()).unwrap();
        assert!(vendor_data.starts_with("#cloud-config\n"));
        assert!(vendor_data.contains("ssh-ed25519 AAAA cluster"));

        let meta_data: serde_yaml::Value =
            serde_yaml::from_slice(&STANDARD.decode(&spec.metadata["meta-data"]).unwrap()).unwrap();
        assert_eq!(meta_data["failure_domain"], serde_yaml::Value::from(HOST1));
        assert_eq!(meta_data["cluster_name"], serde_yaml::Value::from(CLUSTER));
        assert_eq!(meta_data["instance_id"], serde_yaml::Value::from("default/worker-0"));
    }

    #[tokio::test]
    async fn test_cluster_label_names_the_cluster_everywhere() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        let mut machine = create_test_machine("worker-0", NAMESPACE, CLUSTER, Some(BOOTSTRAP_SECRET));
        machine.spec.cluster_name = "stale-name".to_string();
        env.store.insert(&machine);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();

        let specs = env.client.created_specs();
        assert_eq!(specs.len(), 1);
        let meta_data: serde_yaml::Value =
            serde_yaml::from_slice(&STANDARD.decode(&specs[0].metadata["meta-data"]).unwrap())
                .unwrap();
        assert_eq!(meta_data["cluster_name"], serde_yaml::Value::from(CLUSTER));
    }

    #[tokio::test]
    async fn test_machine_ssh_keys_take_precedence() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        let mut machine = stored_machine(&env.store).unwrap();
        machine.spec.ssh_public_keys = vec![SshPublicKey {
            user: "ubuntu".to_string(),
            authorized_keys: vec!["ssh-ed25519 BBBB machine".to_string()],
        }];
        env.store.insert(&machine);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();

        let spec = &env.client.created_specs()[0];
        let vendor_data =
            String::from_utf8(STANDARD.decode(&spec.metadata["vendor-data"]).unwrap()).unwrap();
        assert!(vendor_data.contains("ssh-ed25519 BBBB machine"));
        assert!(!vendor_data.contains("ssh-ed25519 AAAA cluster"));
    }

    #[tokio::test]
    async fn test_existing_microvm_is_adopted_without_create() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.client
            .add_microvm_in_state(NAMESPACE, "worker-0", "uid-42", MicroVmState::Created);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();

        assert_eq!(env.client.create_calls(), 0);
        let machine = stored_machine(&env.store).unwrap();
        assert_eq!(machine.spec.provider_id.as_deref(), Some("microvm://host1:9090/uid-42"));
        assert!(machine.status.unwrap().ready);
    }

    #[tokio::test]
    async fn test_waits_for_cluster_infrastructure() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        let mut cluster = create_test_cluster(CLUSTER, NAMESPACE, CLUSTER);
        cluster.status = Some(ClusterStatus {
            infrastructure_ready: false,
        });
        env.store.insert(&cluster);

        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(env.client.get_calls(), 0);

        let condition = microvm_ready_condition(&env.store);
        assert_eq!(
            condition.reason.as_deref(),
            Some(WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON)
        );
        assert_eq!(condition.severity, Some(ConditionSeverity::Info));
        assert!(stored_machine(&env.store).unwrap().metadata.finalizers.is_none());
    }

    #[tokio::test]
    async fn test_waits_for_bootstrap_data() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.store
            .insert(&create_test_machine("worker-0", NAMESPACE, CLUSTER, None));

        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(env.client.create_calls(), 0);
        assert_eq!(
            microvm_ready_condition(&env.store).reason.as_deref(),
            Some(WAITING_FOR_BOOTSTRAP_DATA_REASON)
        );
    }

    #[tokio::test]
    async fn test_no_owner_is_a_no_op() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        let mut machine = stored_machine(&env.store).unwrap();
        machine.metadata.owner_references = None;
        env.store.insert(&machine);

        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(env.store.patches().is_empty());
        assert_eq!(env.client.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_paused_cluster_is_a_no_op() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        let mut cluster = create_test_cluster(CLUSTER, NAMESPACE, CLUSTER);
        cluster.spec.paused = Some(true);
        env.store.insert(&cluster);

        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(env.store.patches().is_empty());
        assert_eq!(env.client.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_microvm_machine_is_a_no_op() {
        let (reconciler, env) = test_reconciler();
        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "ghost")
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(env.store.patches().is_empty());
    }

    #[tokio::test]
    async fn test_failed_microvm_escalates() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.client.set_create_state(MicroVmState::Failed);

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::MicrovmFailed(_)));

        let status = machine_status(&env.store);
        assert_eq!(status.vm_state, Some(VmState::Failed));
        assert_eq!(
            status.failure_reason.as_deref(),
            Some(MICROVM_PROVISION_FAILED_REASON)
        );
        let condition = get_condition(&status.conditions, MICROVM_READY_CONDITION).unwrap();
        assert_eq!(condition.severity, Some(ConditionSeverity::Error));
        assert_eq!(condition.message.as_deref(), Some("microvm is in a failed state"));
        // The provider id was persisted before the state was mapped.
        assert!(stored_machine(&env.store).unwrap().spec.provider_id.is_some());
    }

    #[tokio::test]
    async fn test_unknown_state_is_surfaced_as_error() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.client
            .add_microvm_in_state(NAMESPACE, "worker-0", "uid-9", MicroVmState::Unknown);

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownMicrovmState(_)));
        assert_eq!(reconciler.error_requeue("m/default/worker-0", &err), REQUEUE_PERIOD);

        let status = machine_status(&env.store);
        assert_eq!(status.vm_state, Some(VmState::Unknown));
        let condition = get_condition(&status.conditions, MICROVM_READY_CONDITION).unwrap();
        assert_eq!(condition.reason.as_deref(), Some(MICROVM_UNKNOWN_STATE_REASON));
        assert_eq!(condition.severity, Some(ConditionSeverity::Error));
    }

    #[tokio::test]
    async fn test_deleting_state_outside_deletion_just_requeues() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.client
            .add_microvm_in_state(NAMESPACE, "worker-0", "uid-3", MicroVmState::Deleting);

        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_PERIOD));
        assert!(get_condition(&machine_status(&env.store).conditions, MICROVM_READY_CONDITION).is_none());
    }

    #[tokio::test]
    async fn test_get_error_does_not_create() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.client.fail_next(MockOperation::Get, "connection reset");

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Microvm(_)));
        assert_eq!(env.client.create_calls(), 0);
        // The finalizer was persisted before talking to the service.
        assert!(
            stored_machine(&env.store)
                .unwrap()
                .metadata
                .finalizers
                .is_some_and(|f| f.contains(&MACHINE_FINALIZER.to_string()))
        );
    }

    #[tokio::test]
    async fn test_create_error_leaves_no_provider_id() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.client.fail_next(MockOperation::Create, "host out of capacity");

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Microvm(_)));
        assert!(stored_machine(&env.store).unwrap().spec.provider_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_bootstrap_secret_and_key() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.store.insert_secret(NAMESPACE, BOOTSTRAP_SECRET, &[("format", b"cloud-config".as_slice())]);

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::MissingBootstrapSecretKey(_)));

        env.store.insert(&create_test_machine(
            "worker-0",
            NAMESPACE,
            CLUSTER,
            Some("does-not-exist"),
        ));
        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::SecretNotFound(_)));
        assert_eq!(env.client.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_explicit_failure_domain_is_used_verbatim() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true), (HOST2, true)]);
        let mut machine = create_test_machine("worker-0", NAMESPACE, CLUSTER, Some(BOOTSTRAP_SECRET));
        machine.spec.failure_domain = Some("host9:9090".to_string());
        env.store.insert(&machine);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();

        assert_eq!(env.factory.requests()[0].0, "host9:9090");
        assert_eq!(
            stored_machine(&env.store).unwrap().spec.provider_id.as_deref(),
            Some("microvm://host9:9090/uid-1")
        );
    }

    #[tokio::test]
    async fn test_provider_id_host_wins_over_explicit_domain() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true), (HOST2, true)]);
        let mut machine = create_test_machine("worker-0", NAMESPACE, CLUSTER, Some(BOOTSTRAP_SECRET));
        machine.spec.failure_domain = Some(HOST1.to_string());
        env.store.insert(&machine);
        let mut microvm_machine =
            create_test_microvm_machine("worker-0", NAMESPACE, CLUSTER, "worker-0");
        microvm_machine.spec.provider_id = Some(format_provider_id(HOST2, "uid-1"));
        env.store.insert(&microvm_machine);
        env.client
            .add_microvm_in_state(NAMESPACE, "worker-0", "uid-1", MicroVmState::Created);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();

        assert_eq!(env.factory.requests()[0].0, HOST2);
        assert_eq!(env.client.create_calls(), 0);
        let machine = stored_machine(&env.store).unwrap();
        assert_eq!(machine.spec.provider_id.as_deref(), Some("microvm://host2:9090/uid-1"));
        assert!(machine.status.unwrap().ready);
    }

    #[tokio::test]
    async fn test_delete_targets_provider_id_host_over_explicit_domain() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true), (HOST2, true)]);
        let mut machine = create_test_machine("worker-0", NAMESPACE, CLUSTER, Some(BOOTSTRAP_SECRET));
        machine.spec.failure_domain = Some(HOST1.to_string());
        env.store.insert(&machine);
        seed_deleting_worker(&env.store, HOST2);
        env.client
            .add_microvm_in_state(NAMESPACE, "worker-0", "uid-1", MicroVmState::Created);

        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_PERIOD));

        let requests = env.factory.requests();
        assert!(requests.iter().all(|(endpoint, _)| endpoint == HOST2));
        assert_eq!(env.client.delete_calls(), 1);
        assert_eq!(env.client.create_calls(), 0);
        // The microvm still exists, so the finalizer stays.
        assert!(stored_machine(&env.store).unwrap().metadata.finalizers.is_some());
    }

    #[tokio::test]
    async fn test_control_plane_machine_needs_eligible_domain() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, false), (HOST2, false)]);
        env.store.insert(&as_control_plane(create_test_machine(
            "worker-0",
            NAMESPACE,
            CLUSTER,
            Some(BOOTSTRAP_SECRET),
        )));

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::NoFailureDomain(_)));
        assert_eq!(env.client.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_fewest_machines_strategy_spreads_load() {
        let mut settings = default_settings();
        settings.placement_strategy = PlacementStrategy::FewestMachines;
        let (reconciler, env) = test_reconciler_with(&settings);
        seed_worker(&env.store, &[(HOST1, true), (HOST2, true)]);

        let mut other = create_test_microvm_machine("worker-1", NAMESPACE, CLUSTER, "worker-1");
        other.spec.provider_id = Some(format_provider_id(HOST1, "uid-7"));
        env.store.insert(&other);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(env.factory.requests()[0].0, HOST2);
    }

    #[tokio::test]
    async fn test_client_options_from_cluster_secrets() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);

        let mut microvm_cluster = create_test_microvm_cluster(CLUSTER, NAMESPACE, CLUSTER, &[(HOST1, true)]);
        if let Some(pool) = microvm_cluster.spec.placement.static_pool.as_mut() {
            pool.basic_auth_secret = Some("host-auth".to_string());
        }
        microvm_cluster.spec.tls_secret_ref = Some("host-tls".to_string());
        env.store.insert(&microvm_cluster);
        env.store
            .insert_secret(NAMESPACE, "host-auth", &[("host1", b"s3cret".as_slice())]);
        let cert = STANDARD.encode("CERT");
        let key = STANDARD.encode("KEY");
        let ca = STANDARD.encode("CA");
        env.store.insert_secret(
            NAMESPACE,
            "host-tls",
            &[
                ("tls.crt", cert.as_bytes()),
                ("tls.key", key.as_bytes()),
                ("ca.crt", ca.as_bytes()),
            ],
        );

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();

        let (endpoint, options) = env.factory.requests().remove(0);
        assert_eq!(endpoint, HOST1);
        assert_eq!(options.basic_auth_token.as_deref(), Some("s3cret"));
        assert_eq!(
            options.tls,
            Some(TlsConfig {
                cert: "CERT".to_string(),
                key: "KEY".to_string(),
                ca_cert: "CA".to_string(),
            })
        );
        assert_eq!(options.proxy, None);
    }

    #[tokio::test]
    async fn test_host_without_token_gets_no_auth() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        let mut microvm_cluster = create_test_microvm_cluster(CLUSTER, NAMESPACE, CLUSTER, &[(HOST1, true)]);
        if let Some(pool) = microvm_cluster.spec.placement.static_pool.as_mut() {
            pool.basic_auth_secret = Some("host-auth".to_string());
        }
        env.store.insert(&microvm_cluster);
        env.store
            .insert_secret(NAMESPACE, "host-auth", &[("host2", b"other".as_slice())]);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(env.factory.requests()[0].1.basic_auth_token, None);
    }

    #[tokio::test]
    async fn test_incomplete_tls_secret_is_an_error() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        let mut microvm_cluster = create_test_microvm_cluster(CLUSTER, NAMESPACE, CLUSTER, &[(HOST1, true)]);
        microvm_cluster.spec.tls_secret_ref = Some("host-tls".to_string());
        env.store.insert(&microvm_cluster);
        let cert = STANDARD.encode("CERT");
        env.store
            .insert_secret(NAMESPACE, "host-tls", &[("tls.crt", cert.as_bytes())]);

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Tls { .. }));
        assert!(env.factory.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cluster_proxy_overrides_global_proxy() {
        let settings = crate::config::ControllerSettings::from_lookup(|key| {
            (key == "MICROVM_PROXY").then(|| "http://global-proxy:3128".to_string())
        })
        .unwrap();
        let (reconciler, env) = test_reconciler_with(&settings);
        seed_worker(&env.store, &[(HOST1, true)]);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(
            env.factory.requests()[0].1.proxy.as_deref(),
            Some("http://global-proxy:3128")
        );

        let mut microvm_cluster = create_test_microvm_cluster(CLUSTER, NAMESPACE, CLUSTER, &[(HOST1, true)]);
        microvm_cluster.spec.microvm_proxy = Some(MicrovmProxy {
            endpoint: "http://cluster-proxy:3128".to_string(),
        });
        env.store.insert(&microvm_cluster);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(
            env.factory.requests()[1].1.proxy.as_deref(),
            Some("http://cluster-proxy:3128")
        );
    }

    #[tokio::test]
    async fn test_delete_with_absent_microvm_clears_finalizer() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        seed_deleting_worker(&env.store, HOST1);

        let action = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(env.client.get_calls(), 1);
        assert_eq!(env.client.delete_calls(), 0);
        assert!(stored_machine(&env.store).is_none(), "finalizer removal releases the object");
    }

    #[tokio::test]
    async fn test_delete_calls_service_once() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        seed_deleting_worker(&env.store, HOST1);
        env.client
            .add_microvm_in_state(NAMESPACE, "worker-0", "uid-1", MicroVmState::Created);

        for _ in 0..3 {
            let action = reconciler
                .reconcile_microvm_machine(NAMESPACE, "worker-0")
                .await
                .unwrap();
            assert_eq!(action, Action::requeue(REQUEUE_PERIOD));
        }
        assert_eq!(env.client.delete_calls(), 1);
        assert_eq!(env.factory.requests()[0].0, HOST1);

        let condition = microvm_ready_condition(&env.store);
        assert_eq!(condition.reason.as_deref(), Some(MICROVM_DELETING_REASON));
        assert_eq!(condition.severity, Some(ConditionSeverity::Info));

        // The service finishes the deletion.
        env.client.remove_microvm(NAMESPACE, "worker-0");
        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert!(stored_machine(&env.store).is_none());
        assert_eq!(env.client.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_error_marks_delete_failed() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        seed_deleting_worker(&env.store, HOST1);
        env.client
            .add_microvm_in_state(NAMESPACE, "worker-0", "uid-1", MicroVmState::Created);
        env.client.fail_next(MockOperation::Delete, "host unreachable");

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Microvm(_)));

        let condition = microvm_ready_condition(&env.store);
        assert_eq!(condition.reason.as_deref(), Some(MICROVM_DELETE_FAILED_REASON));
        assert_eq!(condition.severity, Some(ConditionSeverity::Error));
        assert!(stored_machine(&env.store).unwrap().metadata.finalizers.is_some());
    }

    #[tokio::test]
    async fn test_delete_without_provider_id_uses_placement() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        let mut machine = create_test_microvm_machine("worker-0", NAMESPACE, CLUSTER, "worker-0");
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        mark_deleting(&mut machine.metadata);
        env.store.insert(&machine);
        env.client
            .add_microvm_in_state(NAMESPACE, "worker-0", "uid-5", MicroVmState::Pending);

        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();
        assert_eq!(env.factory.requests()[0].0, HOST1);
        assert_eq!(env.client.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_status_patch_failure_after_successful_pass_is_returned() {
        let (reconciler, env) = test_reconciler();
        seed_worker(&env.store, &[(HOST1, true)]);
        env.client.set_create_state(MicroVmState::Created);
        reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap();

        // A concurrent writer flips the status; the next pass restores it and its
        // single write fails.
        let mut machine = stored_machine(&env.store).unwrap();
        machine.status.as_mut().unwrap().ready = false;
        env.store.insert(&machine);
        env.store.fail_patches(1);

        let err = reconciler
            .reconcile_microvm_machine(NAMESPACE, "worker-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Conflict(_)));
    }
}
