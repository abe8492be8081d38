//! Integration tests for the client facade.
//!
//! These tests validate that:
//! - Submissions are routed by the load balancer, connecting sessions on demand.
//! - Status queries go out on the owning session and only for background jobs.
//! - `end()` disconnects every session and closes every tracked job.
//! - Failures reach the caller through the submission result.

mod common;

use std::sync::Arc;

use client::{Client, ClientEvent, ConnectionState, SubmitError, SubmittedJob};
use common::{DuplexConnector, FakeServer, ServerEnds, WAIT};
use protocol::{
    ClientConfig, ClientError, JobEvent, JobFailure, JobHandle, JobSpec, JobState, LoadBalancer,
    LoadBalancing, PacketType, Priority, ServerAddress, ServerSlot,
};
use tokio::time::timeout;

fn two_servers() -> ClientConfig {
    ClientConfig::with_servers(vec![
        ServerAddress::new("a.example", 4730),
        ServerAddress::new("b.example", 4730),
    ])
}

fn client_with(config: ClientConfig) -> (Client, ServerEnds) {
    let (connector, servers) = DuplexConnector::new();
    let client = Client::builder(config).connector(connector).build().unwrap();
    (client, servers)
}

/// Submits `spec` while playing the server on the next accepted connection,
/// acknowledging it with `handle`.
async fn submit_acknowledged(
    client: &Client,
    servers: &mut ServerEnds,
    spec: JobSpec,
    handle: &str,
) -> (SubmittedJob, FakeServer) {
    let serve = async {
        let mut server = servers.accept().await;
        server.next_request().await;
        server.job_created(handle).await;
        server
    };
    let (submitted, server) = tokio::join!(client.submit_job(spec), serve);
    (submitted.unwrap(), server)
}

async fn next_event(submitted: &mut SubmittedJob) -> JobEvent {
    timeout(WAIT, submitted.next_event())
        .await
        .expect("timed out waiting for a job event")
        .expect("job event stream closed")
}

#[tokio::test]
async fn background_job_is_acknowledged_and_polled_on_its_session() {
    let (client, mut servers) = client_with(two_servers());
    let mut client_events = client.subscribe();

    let spec = JobSpec::new("reverse", "hello").background();
    let serve = async {
        let mut server = servers.accept().await;
        let request = server.next_request().await;
        assert_eq!(request.kind(), PacketType::SubmitJobBg);
        assert_eq!(request.args(), &[b"reverse".to_vec(), Vec::new(), b"hello".to_vec()]);
        server.job_created("H:1").await;
        server
    };
    let (submitted, mut server) = tokio::join!(client.submit_job(spec), serve);
    let mut submitted = submitted.unwrap();

    assert_eq!(server.address, ServerAddress::new("a.example", 4730));
    assert_eq!(submitted.handle().as_str(), "H:1");
    assert_eq!(submitted.job().state(), JobState::Acknowledged);
    assert_eq!(submitted.job().session().unwrap().as_str(), "a.example:4730");
    assert_eq!(client.job_count(), 1);
    assert_eq!(client.sessions()[0].state(), ConnectionState::Connected);
    assert_eq!(client.sessions()[1].state(), ConnectionState::Disconnected);
    assert!(matches!(
        client_events.recv().await.unwrap(),
        ClientEvent::Connected { .. }
    ));
    assert!(matches!(
        client_events.recv().await.unwrap(),
        ClientEvent::Submitted { pending: 1, .. }
    ));

    client.get_status(submitted.job()).await.unwrap();
    let request = server.next_request().await;
    assert_eq!(request.kind(), PacketType::GetStatus);
    assert_eq!(request.arg(0), Some(&b"H:1"[..]));

    server
        .reply(PacketType::StatusRes, &[b"H:1", b"1", b"1", b"3", b"4"])
        .await;
    assert!(matches!(next_event(&mut submitted).await, JobEvent::Created { .. }));
    match next_event(&mut submitted).await {
        JobEvent::Status(status) => {
            assert!(status.known);
            assert!(status.running);
            assert_eq!(status.progress.numerator, 3);
            assert_eq!(status.progress.denominator, 4);
        }
        other => panic!("expected a status event, got {other:?}"),
    }
    assert_eq!(submitted.job().state(), JobState::Acknowledged);

    client.end().await;
    server.expect_closed().await;
    assert_eq!(client.job_count(), 0);
    assert_eq!(submitted.job().state(), JobState::Closed);
    assert_eq!(next_event(&mut submitted).await, JobEvent::Closed);
}

#[tokio::test]
async fn status_of_a_foreground_job_is_rejected_without_io() {
    let (client, mut servers) = client_with(two_servers());
    let (submitted, mut server) = submit_acknowledged(
        &client,
        &mut servers,
        JobSpec::new("reverse", "hello"),
        "H:1",
    )
    .await;

    let error = client.get_status(submitted.job()).await.unwrap_err();
    assert!(matches!(error, ClientError::JobState { .. }));

    // Nothing else may have been written before the disconnect.
    client.end().await;
    server.expect_closed().await;
}

#[tokio::test]
async fn foreground_job_completes_and_leaves_the_table() {
    let (client, mut servers) = client_with(ClientConfig::single("a.example", 4730));
    let spec = JobSpec::new("reverse", "hello").with_priority(Priority::High);
    let serve = async {
        let mut server = servers.accept().await;
        let request = server.next_request().await;
        assert_eq!(request.kind(), PacketType::SubmitJobHigh);
        server.job_created("H:7").await;
        server
    };
    let (submitted, mut server) = tokio::join!(client.submit_job(spec), serve);
    let mut submitted = submitted.unwrap();
    assert_eq!(client.jobs(submitted.handle()).len(), 1);

    server
        .reply(PacketType::WorkComplete, &[b"H:7", b"olleh"])
        .await;
    let result = timeout(WAIT, submitted.wait_for_result()).await.unwrap();
    assert_eq!(result.unwrap(), b"olleh".to_vec());
    assert_eq!(client.job_count(), 0);
    assert!(submitted.job().snapshot().finished_at().is_some());
}

#[tokio::test]
async fn work_fail_is_reported_by_wait_for_result() {
    let (client, mut servers) = client_with(ClientConfig::single("a.example", 4730));
    let (mut submitted, mut server) = submit_acknowledged(
        &client,
        &mut servers,
        JobSpec::new("reverse", "hello"),
        "H:1",
    )
    .await;

    server.reply(PacketType::WorkFail, &[b"H:1"]).await;
    let result = timeout(WAIT, submitted.wait_for_result()).await.unwrap();
    assert_eq!(result.unwrap_err(), JobFailure::WorkFailed);
    assert_eq!(client.job_count(), 0);
}

#[tokio::test]
async fn connection_lost_before_acknowledgement_fails_the_submission() {
    let (client, mut servers) = client_with(two_servers());
    let mut client_events = client.subscribe();

    let serve = async {
        let mut server = servers.accept().await;
        server.next_request().await;
        drop(server);
    };
    let (result, ()) = tokio::join!(client.submit_job(JobSpec::new("reverse", "hello")), serve);

    let SubmitError { job, source } = result.unwrap_err();
    assert!(matches!(source, ClientError::Connection { .. }));
    let job = job.expect("submitted job is returned");
    assert!(job.handle().is_none());
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(client.job_count(), 0);
    assert_eq!(client.sessions()[0].state(), ConnectionState::Disconnected);

    loop {
        if let ClientEvent::Error { error, .. } = client_events.recv().await.unwrap() {
            assert!(matches!(error, ClientError::Connection { .. }));
            break;
        }
    }
}

#[tokio::test]
async fn end_fails_submissions_still_awaiting_acknowledgement() {
    let (client, mut servers) = client_with(two_servers());

    let serve = async {
        let mut server = servers.accept().await;
        server.next_request().await;
        client.end().await;
        server.expect_closed().await;
    };
    let (result, ()) = tokio::join!(client.submit_job(JobSpec::new("reverse", "hello")), serve);

    let SubmitError { job, source } = result.unwrap_err();
    assert!(matches!(source, ClientError::Connection { .. }));
    let job = job.expect("submitted job is returned");
    assert!(job.handle().is_none());
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(client.job_count(), 0);
    for session in client.sessions() {
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
    assert!(servers.is_idle());
}

#[tokio::test]
async fn session_failure_fails_background_jobs_in_the_table() {
    let (client, mut servers) = client_with(ClientConfig::single("a.example", 4730));
    let (mut submitted, server) = submit_acknowledged(
        &client,
        &mut servers,
        JobSpec::new("reverse", "hello").background(),
        "H:1",
    )
    .await;
    assert_eq!(client.job_count(), 1);

    drop(server);
    next_event(&mut submitted).await;
    assert!(matches!(
        next_event(&mut submitted).await,
        JobEvent::Failed(JobFailure::Client(ClientError::Connection { .. }))
    ));
    assert_eq!(client.job_count(), 0);
}

#[tokio::test]
async fn round_robin_alternates_between_sessions() {
    let (client, mut servers) = client_with(two_servers().load_balancing(LoadBalancing::RoundRobin));

    let (first, _a) =
        submit_acknowledged(&client, &mut servers, JobSpec::new("reverse", "1"), "H:a1").await;
    let (second, _b) =
        submit_acknowledged(&client, &mut servers, JobSpec::new("reverse", "2"), "H:b1").await;

    assert_eq!(first.job().session().unwrap().as_str(), "a.example:4730");
    assert_eq!(second.job().session().unwrap().as_str(), "b.example:4730");
    assert_eq!(client.job_count(), 2);
}

#[tokio::test]
async fn submissions_sharing_a_handle_are_all_completed() {
    let (client, mut servers) = client_with(ClientConfig::single("a.example", 4730));
    let spec = JobSpec::new("reverse", "hello").with_unique("greeting");
    let (mut first, mut server) =
        submit_acknowledged(&client, &mut servers, spec.clone(), "H:1").await;

    let serve = async {
        let request = server.next_request().await;
        assert_eq!(request.arg(1), Some(&b"greeting"[..]));
        server.job_created("H:1").await;
    };
    let (second, ()) = tokio::join!(client.submit_job(spec), serve);
    let mut second = second.unwrap();

    let handle = JobHandle::new("H:1").unwrap();
    assert_eq!(client.jobs(&handle).len(), 2);

    server
        .reply(PacketType::WorkComplete, &[b"H:1", b"olleh"])
        .await;
    for submitted in [&mut first, &mut second] {
        let result = timeout(WAIT, submitted.wait_for_result()).await.unwrap();
        assert_eq!(result.unwrap(), b"olleh".to_vec());
    }
    assert_eq!(client.job_count(), 0);
}

#[tokio::test]
async fn close_job_detaches_it_from_the_client() {
    let (client, mut servers) = client_with(ClientConfig::single("a.example", 4730));
    let (mut submitted, mut server) = submit_acknowledged(
        &client,
        &mut servers,
        JobSpec::new("reverse", "hello"),
        "H:1",
    )
    .await;

    assert!(client.close_job(submitted.job()));
    assert!(!client.close_job(submitted.job()));
    assert_eq!(client.job_count(), 0);

    // A late completion for the abandoned job is dropped.
    server
        .reply(PacketType::WorkComplete, &[b"H:1", b"olleh"])
        .await;
    let result = timeout(WAIT, submitted.wait_for_result()).await.unwrap();
    assert!(matches!(result, Err(JobFailure::Client(ClientError::JobState { .. }))));
    assert_eq!(submitted.job().state(), JobState::Closed);
}

#[tokio::test]
async fn invalid_spec_is_rejected_before_connecting() {
    let (client, mut servers) = client_with(ClientConfig::single("a.example", 4730));

    let SubmitError { job, source } = client
        .submit_job(JobSpec::new("", "hello"))
        .await
        .unwrap_err();
    assert!(job.is_none());
    assert!(matches!(source, ClientError::Configuration { .. }));
    assert!(servers.is_idle());
}

struct NoServer;

impl LoadBalancer for NoServer {
    fn choose(&self, _candidates: &[ServerSlot]) -> Option<usize> {
        None
    }
}

#[tokio::test]
async fn load_balancer_choosing_nothing_is_a_configuration_error() {
    let (connector, mut servers) = DuplexConnector::new();
    let client = Client::builder(two_servers())
        .connector(connector)
        .load_balancer(Arc::new(NoServer))
        .build()
        .unwrap();

    let SubmitError { job, source } = client
        .submit_job(JobSpec::new("reverse", "hello"))
        .await
        .unwrap_err();
    assert_eq!(job.unwrap().state(), JobState::New);
    assert!(matches!(source, ClientError::Configuration { .. }));
    assert!(servers.is_idle());
}

#[tokio::test]
async fn invalid_configuration_is_rejected_synchronously() {
    let error = Client::new(ClientConfig::with_servers(Vec::new())).unwrap_err();
    assert_eq!(error, ClientError::configuration("servers: empty array"));
}
