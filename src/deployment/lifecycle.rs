//! Deployment lifecycle: deploy, start, stop
//!
//! Provisioning and launching run as tasks on the deployment's scheduler and
//! are joined before the phase returns. Tasks already issued keep running
//! when the caller stops polling, and record their results on the host or
//! service directly.

use super::plan::{plan_links, Materializer};
use super::state::{DeploymentState, StartReport};
use super::Deployment;
use crate::error::{DeployError, Result};
use crate::host::Host;
use crate::service::{Service, ServiceState};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

impl Deployment {
    fn invalid_phase(&self, operation: &str) -> DeployError {
        DeployError::InvalidPhase {
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }

    /// Provision every host, bind listening endpoints and resolve every port
    pub async fn deploy(&mut self) -> Result<()> {
        if self.state != DeploymentState::Building {
            return Err(self.invalid_phase("deploy"));
        }

        let links = plan_links(&self.connections, &self.services)?;
        tracing::info!(
            "Deploying {} ({} hosts, {} services, {} links)",
            self.id,
            self.hosts.len(),
            self.services.len(),
            links.len()
        );

        self.provision_hosts().await?;

        let mut materializer = Materializer::new(&self.services, self.network.clone());
        for connection in self.connections.iter() {
            materializer.connection(connection).await?;
        }
        let resolved = materializer.finish();
        for service in &self.services {
            service.mark_deployed();
        }

        self.state = DeploymentState::Deployed;
        tracing::info!("Deployment {} deployed, {} ports resolved", self.id, resolved);
        Ok(())
    }

    async fn provision_hosts(&self) -> Result<()> {
        let pending: Vec<Host> = self
            .hosts
            .iter()
            .filter(|h| !h.is_provisioned())
            .cloned()
            .collect();

        let handles = pending.iter().map(|host| {
            let host = host.clone();
            let provisioner = self.provisioner.clone();
            self.scheduler.spawn(async move {
                tracing::info!("Provisioning host {}", host);
                let reachability = provisioner.provision(&host).await?;
                tracing::info!("Host {} reachable at {}", host, reachability.internal_address);
                host.set_reachability(reachability);
                Ok::<_, DeployError>(())
            })
        });
        let results = join_all(handles).await;

        let mut first_error = None;
        for (host, result) in pending.iter().zip(results) {
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => DeployError::Provisioning {
                    host: host.name().to_string(),
                    message: format!("provisioning task failed: {}", e),
                },
            };
            tracing::error!("Failed to provision host {}: {}", host, error);
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Launch every managed service. A failed launch is reported and does not
    /// prevent the other services from starting.
    pub async fn start(&mut self) -> Result<StartReport> {
        if self.state != DeploymentState::Deployed {
            return Err(self.invalid_phase("start"));
        }

        let managed: Vec<Arc<Service>> = self
            .services
            .iter()
            .filter(|s| s.kind().is_managed())
            .cloned()
            .collect();
        tracing::info!("Starting {} services", managed.len());

        let permits = Arc::new(Semaphore::new(self.config.launch_concurrency));
        let handles = managed.iter().map(|service| {
            let service = service.clone();
            let launcher = self.launcher.clone();
            let scheduler = self.scheduler.clone();
            let permits = permits.clone();
            self.scheduler.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| DeployError::Internal(e.to_string()))?;
                service.launch(launcher.as_ref(), &scheduler).await
            })
        });
        let results = join_all(handles).await;

        let mut report = StartReport::default();
        for (service, result) in managed.iter().zip(results) {
            let name = service.name().to_string();
            match result {
                Ok(Ok(_)) => report.launched.push(name),
                Ok(Err(e)) => report.failed.push((name, e.to_string())),
                Err(e) => report.failed.push((name, format!("launch task failed: {}", e))),
            }
        }

        self.state = DeploymentState::Started;
        if report.is_complete() {
            tracing::info!("Deployment {} started", self.id);
        } else {
            tracing::warn!(
                "Deployment {} started with {} failed services",
                self.id,
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Stop every running service
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            DeploymentState::Building => return Err(self.invalid_phase("stop")),
            DeploymentState::Stopped => return Ok(()),
            DeploymentState::Deployed | DeploymentState::Started => {}
        }

        let running: Vec<&Arc<Service>> = self
            .services
            .iter()
            .filter(|s| s.state() == ServiceState::Running)
            .collect();
        tracing::info!("Stopping {} services", running.len());

        let results = join_all(running.iter().map(|s| s.stop())).await;
        for (service, result) in running.iter().zip(results) {
            match result {
                Ok(code) => tracing::debug!("Service {} stopped with code {}", service.display_id(), code),
                Err(e) => tracing::warn!("Failed to stop service {}: {}", service.display_id(), e),
            }
        }

        self.state = DeploymentState::Stopped;
        Ok(())
    }

    /// Deploy, start, wait for `trigger`, then stop
    pub async fn run_until<F>(&mut self, trigger: F) -> Result<StartReport>
    where
        F: Future<Output = ()>,
    {
        self.deploy().await?;
        self.start_until(trigger).await
    }

    /// Start an already deployed graph, wait for `trigger`, then stop
    pub async fn start_until<F>(&mut self, trigger: F) -> Result<StartReport>
    where
        F: Future<Output = ()>,
    {
        let report = self.start().await?;
        trigger.await;
        self.stop().await?;
        Ok(report)
    }

    /// Deploy, start and run until Ctrl-C
    pub async fn run_ctrl_c(&mut self) -> Result<StartReport> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
    }

    /// Stop running services, then cancel and join every background task
    pub async fn shutdown(&mut self) -> Result<()> {
        if matches!(self.state, DeploymentState::Deployed | DeploymentState::Started) {
            self.stop().await?;
        }
        self.scheduler.shutdown().await;
        tracing::info!("Deployment {} shut down", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::DeploymentConfig;
    use super::*;
    use crate::host::{CloudVmParams, HostKind, Provisioner, Reachability, StaticProvisioner};
    use crate::launch::mock::{MockLauncher, MockScript};
    use crate::network::{prefix_tag, PortConfig};
    use crate::port::{Sink, Source};
    use crate::service::{CrateSpec, ExternalSpec};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::IpAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records the ports each host asked for when it was provisioned
    #[derive(Default)]
    struct RecordingProvisioner {
        seen: Mutex<Vec<(String, Vec<u16>)>>,
    }

    #[async_trait]
    impl Provisioner for RecordingProvisioner {
        async fn provision(&self, host: &Host) -> Result<Reachability> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((host.name().to_string(), host.requested_ports()));
            }
            Ok(Reachability::new(IpAddr::from([10, 0, 0, 9])).open_ports(host.requested_ports()))
        }
    }

    fn config() -> DeploymentConfig {
        DeploymentConfig::new()
            .stop_timeout(Duration::from_millis(200))
            .output_drain_interval(Duration::from_millis(10))
            .dial_attempts(3)
            .dial_delay(Duration::from_millis(20))
    }

    fn deployment(launcher: &Arc<MockLauncher>) -> Deployment {
        Deployment::with_config(config()).with_launcher(launcher.clone())
    }

    #[tokio::test]
    async fn test_direct_connection_delivers_bytes() {
        let mut deployment = Deployment::with_config(config());
        let local = deployment.localhost().clone();
        let sender = deployment.add_service("sender", &local, ExternalSpec::new()).unwrap();
        let receiver = deployment.add_service("receiver", &local, ExternalSpec::new()).unwrap();
        deployment.connect(sender.port("out"), receiver.port("in")).unwrap();

        deployment.deploy().await.unwrap();
        assert_eq!(deployment.state(), DeploymentState::Deployed);
        assert!(matches!(receiver.port("in").config(), Some(PortConfig::Listen(_))));
        assert!(matches!(sender.port("out").config(), Some(PortConfig::Dial(_))));

        let out = sender.port("out");
        let input = receiver.port("in");
        let (tx, rx) = tokio::join!(out.connect(), input.connect());
        let (tx, rx) = (tx.unwrap(), rx.unwrap());

        tx.send(b"hello world".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(Bytes::from_static(b"hello world")));
        assert!(Arc::ptr_eq(&tx, &out.connect().await.unwrap()));
    }

    #[tokio::test]
    async fn test_demux_reaches_only_tagged_follower() {
        let mut deployment = Deployment::with_config(config());
        let local = deployment.localhost().clone();
        let leader = deployment.add_service("leader", &local, ExternalSpec::new()).unwrap();
        let f0 = deployment.add_service("follower0", &local, ExternalSpec::new()).unwrap();
        let f1 = deployment.add_service("follower1", &local, ExternalSpec::new()).unwrap();
        deployment
            .connect(
                leader.port("out"),
                Sink::demux([(0, f0.port("in")), (1, f1.port("in"))]),
            )
            .unwrap();
        deployment.deploy().await.unwrap();

        let (out, in0, in1) = (leader.port("out"), f0.port("in"), f1.port("in"));
        let (tx, rx0, rx1) = tokio::join!(out.connect(), in0.connect(), in1.connect());
        let (tx, rx0, rx1) = (tx.unwrap(), rx0.unwrap(), rx1.unwrap());

        tx.send(prefix_tag(0, b"for zero")).await.unwrap();
        assert_eq!(rx0.recv().await.unwrap(), Some(Bytes::from_static(b"for zero")));
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx1.recv()).await;
        assert!(nothing.is_err());

        tx.send(prefix_tag(7, b"lost")).await.unwrap();
        assert!(matches!(tx.next_delivery_error().await, Some(DeployError::DemuxTag(7))));

        tx.send(prefix_tag(1, b"for one")).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap(), Some(Bytes::from_static(b"for one")));
    }

    #[tokio::test]
    async fn test_tagged_into_demux_round_trips() {
        let mut deployment = Deployment::with_config(config());
        let local = deployment.localhost().clone();
        let a = deployment.add_service("a", &local, ExternalSpec::new()).unwrap();
        let b = deployment.add_service("b", &local, ExternalSpec::new()).unwrap();
        deployment
            .connect(a.port("out").tagged(3), Sink::demux([(3, b.port("in"))]))
            .unwrap();
        deployment.deploy().await.unwrap();

        let (out, input) = (a.port("out"), b.port("in"));
        let (tx, rx) = tokio::join!(out.connect(), input.connect());
        let (tx, rx) = (tx.unwrap(), rx.unwrap());

        tx.send(Bytes::from_static(b"\x00\x01payload")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(Bytes::from_static(b"\x00\x01payload")));
    }

    #[tokio::test]
    async fn test_merge_keeps_sender_order() {
        let mut deployment = Deployment::with_config(config());
        let local = deployment.localhost().clone();
        let sink = deployment.add_service("sink", &local, ExternalSpec::new()).unwrap();
        let mut senders = Vec::new();
        for i in 0..3 {
            let sender = deployment
                .add_service(&format!("sender{}", i), &local, ExternalSpec::new())
                .unwrap();
            deployment.connect(sender.port("out"), sink.port("in").merge()).unwrap();
            senders.push(sender.port("out"));
        }
        assert!(deployment.connections().is_merged(sink.port("in").key()));
        deployment.deploy().await.unwrap();

        let input = sink.port("in");
        let (rx, txs) = tokio::join!(
            input.connect(),
            futures::future::try_join_all(senders.iter().map(|p| p.connect()))
        );
        let (rx, txs) = (rx.unwrap(), txs.unwrap());

        for (i, tx) in txs.iter().enumerate() {
            for n in 0..3u8 {
                tx.send(vec![i as u8, n]).await.unwrap();
            }
        }

        let mut seen: Vec<Vec<u8>> = vec![Vec::new(); 3];
        for _ in 0..9 {
            let frame = rx.recv().await.unwrap().unwrap();
            seen[frame[0] as usize].push(frame[1]);
        }
        assert!(seen.iter().all(|order| order == &vec![0, 1, 2]));
    }

    #[tokio::test]
    async fn test_start_before_deploy_fails() {
        let launcher = Arc::new(MockLauncher::new());
        let mut deployment = deployment(&launcher);
        let local = deployment.localhost().clone();
        deployment.add_service("svc", &local, CrateSpec::new(".")).unwrap();

        assert!(matches!(deployment.start().await, Err(DeployError::InvalidPhase { .. })));
        assert!(matches!(deployment.stop().await, Err(DeployError::InvalidPhase { .. })));
        assert!(launcher.launched().is_empty());
        assert_eq!(deployment.state(), DeploymentState::Building);
    }

    #[tokio::test]
    async fn test_client_only_both_sides_fails_deploy() {
        let launcher = Arc::new(MockLauncher::new());
        let mut deployment = deployment(&launcher);
        let client = deployment.localhost().client_only();
        let a = deployment.add_service("a", &client, CrateSpec::new(".")).unwrap();
        let b = deployment.add_service("b", &client, CrateSpec::new(".")).unwrap();
        deployment.connect(a.port("out"), b.port("in")).unwrap();

        assert!(matches!(deployment.deploy().await, Err(DeployError::PortBind(_))));
        assert_eq!(deployment.state(), DeploymentState::Building);
        assert!(!a.port("out").is_resolved());
    }

    #[tokio::test]
    async fn test_provisioning_failure_keeps_partial_reachability() {
        let mut deployment = Deployment::with_config(config());
        let vm = deployment
            .add_host("vm", HostKind::CloudVm(CloudVmParams::new("gcp", "p")))
            .unwrap();
        deployment.add_service("worker", &vm, CrateSpec::new(".")).unwrap();

        let err = deployment.deploy().await.unwrap_err();
        assert!(matches!(err, DeployError::Provisioning { ref host, .. } if host == "vm"));
        assert!(deployment.localhost().is_provisioned());
        assert!(!vm.is_provisioned());
        assert_eq!(deployment.state(), DeploymentState::Building);
    }

    #[tokio::test]
    async fn test_connect_after_deploy_rejected() {
        let mut deployment = Deployment::with_config(config());
        let local = deployment.localhost().clone();
        let a = deployment.add_service("a", &local, ExternalSpec::new()).unwrap();
        let b = deployment.add_service("b", &local, ExternalSpec::new()).unwrap();
        deployment.deploy().await.unwrap();

        assert!(matches!(
            deployment.connect(a.port("out"), b.port("in")),
            Err(DeployError::InvalidPhase { .. })
        ));
        assert!(deployment.add_service("c", &local, ExternalSpec::new()).is_err());
        assert!(matches!(deployment.deploy().await, Err(DeployError::InvalidPhase { .. })));
    }

    #[tokio::test]
    async fn test_launch_failure_isolated() {
        let launcher = Arc::new(
            MockLauncher::new()
                .script("broken", MockScript::fails("binary missing"))
                .script("healthy", MockScript::default()),
        );
        let mut deployment = deployment(&launcher);
        let local = deployment.localhost().clone();
        let broken = deployment.add_service("broken", &local, CrateSpec::new(".")).unwrap();
        let healthy = deployment.add_service("healthy", &local, CrateSpec::new(".")).unwrap();

        deployment.deploy().await.unwrap();
        let report = deployment.start().await.unwrap();

        assert_eq!(report.launched, vec!["healthy".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(matches!(broken.state(), ServiceState::LaunchFailed(_)));
        assert_eq!(healthy.state(), ServiceState::Running);

        deployment.stop().await.unwrap();
        assert_eq!(healthy.state(), ServiceState::Exited(143));
        assert_eq!(deployment.state(), DeploymentState::Stopped);
        deployment.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_managed_source_listens_for_external_destination() {
        let launcher = Arc::new(MockLauncher::new());
        let mut deployment = deployment(&launcher);
        let local = deployment.localhost().clone();
        let producer = deployment.add_service("producer", &local, CrateSpec::new(".")).unwrap();
        let consumer = deployment.add_service("consumer", &local, ExternalSpec::new()).unwrap();
        deployment.connect(producer.port("out"), consumer.port("in")).unwrap();

        deployment.deploy().await.unwrap();
        deployment.start().await.unwrap();

        let launched = launcher.launched();
        assert_eq!(launched.len(), 1);
        let Some(PortConfig::Listen(addr)) = launched[0].ports.get("out").cloned() else {
            panic!("producer should listen");
        };
        assert_eq!(consumer.port("in").config(), Some(&PortConfig::Dial(addr)));

        deployment.shutdown().await.unwrap();
        assert!(deployment.scheduler().is_shut_down());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_all_output() {
        let launcher = Arc::new(
            MockLauncher::new().script("talker", MockScript::exits(0).stdout(&["one", "two", "three"])),
        );
        let mut deployment = deployment(&launcher);
        let local = deployment.localhost().clone();
        let talker = deployment.add_service("talker", &local, CrateSpec::new(".")).unwrap();

        deployment.deploy().await.unwrap();
        deployment.start().await.unwrap();
        assert_eq!(talker.exit_code().await.unwrap(), 0);
        assert_eq!(talker.exit_code().await.unwrap(), 0);

        let mut stdout = talker.stdout().unwrap();
        let mut lines = Vec::new();
        while let Some(line) = stdout.next_line().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_external_ports_reach_provisioner() {
        let provisioner = Arc::new(RecordingProvisioner::default());
        let mut deployment = Deployment::with_config(config()).with_provisioner(provisioner.clone());
        let vm = deployment
            .add_host("vm", HostKind::CloudVm(CloudVmParams::new("gcp", "p")))
            .unwrap();
        deployment
            .add_service("gateway", &vm.client_only(), ExternalSpec::new().port(8443).port(8080))
            .unwrap();
        deployment.add_service("admin", &vm, ExternalSpec::new().port(8080)).unwrap();

        deployment.deploy().await.unwrap();

        let seen = provisioner.seen.lock().unwrap().clone();
        assert!(seen.contains(&("vm".to_string(), vec![8080, 8443])));
        assert!(seen.contains(&("localhost".to_string(), Vec::new())));
        assert_eq!(vm.reachability().map(|r| r.open_ports.clone()), Some(vec![8080, 8443]));
    }

    #[tokio::test]
    async fn test_external_sender_reaches_launched_receiver() {
        let launcher = Arc::new(MockLauncher::new());
        let mut deployment = deployment(&launcher);
        let local = deployment.localhost().clone();
        let sender = deployment.add_service("sender", &local, ExternalSpec::new()).unwrap();
        let receiver = deployment.add_service("receiver", &local, CrateSpec::new(".")).unwrap();
        deployment.connect(sender.port("out"), receiver.port("in")).unwrap();

        deployment.deploy().await.unwrap();
        deployment.start().await.unwrap();

        let launched = launcher.launched();
        assert_eq!(launched.len(), 1);
        assert!(matches!(launched[0].port("in"), Ok(PortConfig::Listen(_))));

        // The engine has released its listener, so the receiver binds the
        // address again itself
        let out = sender.port("out");
        let (rx, tx) = tokio::join!(launched[0].connect("in"), out.connect());
        let (rx, tx) = (rx.unwrap(), tx.unwrap());

        tx.send(b"hi".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(Bytes::from_static(b"hi")));

        deployment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_null_source_does_not_hold_merge_open() {
        let mut deployment = Deployment::with_config(config());
        let local = deployment.localhost().clone();
        let sender = deployment.add_service("sender", &local, ExternalSpec::new()).unwrap();
        let sink = deployment.add_service("sink", &local, ExternalSpec::new()).unwrap();
        deployment.connect(Source::Null, sink.port("in").merge()).unwrap();
        deployment.connect(sender.port("out"), sink.port("in").merge()).unwrap();
        deployment.deploy().await.unwrap();
        assert!(matches!(sink.port("in").config(), Some(PortConfig::Merge(ref c)) if c.len() == 1));

        let (out, input) = (sender.port("out"), sink.port("in"));
        let (tx, rx) = tokio::join!(out.connect(), input.connect());
        let (tx, rx) = (tx.unwrap(), rx.unwrap());

        tx.send(b"last".to_vec()).await.unwrap();
        tx.close().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(Bytes::from_static(b"last")));
        let end = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(end.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_unconnected_port_after_deploy() {
        let mut deployment = Deployment::with_config(config());
        let local = deployment.localhost().clone();
        let a = deployment.add_service("a", &local, ExternalSpec::new()).unwrap();
        let b = deployment.add_service("b", &local, ExternalSpec::new()).unwrap();
        deployment.connect(a.port("out"), b.port("in")).unwrap();

        let spare = a.port("spare");
        assert!(matches!(spare.connect().await, Err(DeployError::InvalidPhase { .. })));

        deployment.deploy().await.unwrap();
        assert!(matches!(spare.connect().await, Err(DeployError::InvalidConnection(_))));
        assert!(matches!(
            b.port("unused").connect().await,
            Err(DeployError::InvalidConnection(ref message)) if message == "port b.unused has no connection"
        ));
    }

    #[tokio::test]
    async fn test_run_until() {
        let launcher = Arc::new(MockLauncher::new());
        let mut deployment = deployment(&launcher)
            .with_provisioner(Arc::new(StaticProvisioner::new().with_host(
                "vm",
                Reachability::new(IpAddr::from([10, 0, 0, 5])),
            )));
        let vm = deployment
            .add_host("vm", HostKind::CloudVm(CloudVmParams::new("gcp", "p")))
            .unwrap();
        let local = deployment.localhost().clone();
        let svc = deployment.add_service("svc", &local, CrateSpec::new(".")).unwrap();

        let report = deployment.run_until(async {}).await.unwrap();
        assert!(report.is_complete());
        assert!(vm.is_provisioned());
        assert_eq!(svc.state(), ServiceState::Exited(143));
        assert_eq!(deployment.state(), DeploymentState::Stopped);
    }
}
