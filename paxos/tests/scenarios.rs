//! End-to-end rounds over the in-process bus, with fault injection.

use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use synod::core::quorum_size;
use synod::{
    Action, AuditEvent, AuditSink, BackoffConfig, Ballot, ChannelSink, Cluster, ClusterView, Liveness, MemorySink,
    NodeId, ProposeError, Proposal, ProposerConfig, Request, Response, Role, Roles, Sleep,
    TracingSink, propose,
};

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for this crate).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("synod=debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    // Thread-local default, so parallel tests don't fight over a global one
    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

type Value = &'static str;

const TIMEOUT: Duration = Duration::from_millis(200);

fn n(id: u64) -> NodeId {
    NodeId(id)
}

fn audited(members: u64) -> (Cluster<Value>, MemorySink<Value>) {
    audited_view(ClusterView::uniform(members))
}

fn audited_view(view: ClusterView) -> (Cluster<Value>, MemorySink<Value>) {
    let sink = MemorySink::new();
    let cluster = Cluster::start(view, Arc::new(sink.clone()));
    (cluster, sink)
}

/// Every decision in the cluster, asserting they agree.
fn agreed_value(cluster: &Cluster<Value>) -> Option<Value> {
    let decisions = cluster.decisions();
    let mut values = decisions.values().map(|d| d.value);
    let first = values.next()?;
    assert!(values.all(|v| v == first), "split decision: {decisions:?}");
    Some(first)
}

/// Timer that has always already fired.
#[derive(Clone, Copy)]
struct Expired;

impl Sleep for Expired {
    async fn sleep(&self, _duration: Duration) {}
}

#[test]
fn quorum_arithmetic() {
    for (members, quorum) in [(1, 1), (3, 2), (4, 3), (5, 3), (7, 4)] {
        assert_eq!(quorum_size(members), quorum);
        assert_eq!(ClusterView::uniform(members as u64).quorum_size(), quorum);
    }
}

/// All five up: one round at the first ballot decides the proposed value.
#[tokio::test]
async fn scenario_a_all_up() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(5);
    let node = cluster.node(n(1)).unwrap();

    let decision = propose(node, "v1", 0, TIMEOUT).await.unwrap();
    assert_eq!(decision.value, "v1");
    assert_eq!(decision.ballot, Ballot::new(1, n(1)));

    // Accept and Decide queue behind the Prepare at every acceptor, so by
    // the time the announce returns every acceptor has answered both phases
    assert_eq!(audit.with_action(Action::PrepareSend).len(), 5);
    assert_eq!(audit.with_action(Action::PromiseSend).len(), 5);
    assert_eq!(audit.with_action(Action::AcceptSend).len(), 5);
    assert_eq!(audit.with_action(Action::AcceptedSend).len(), 5);
    assert_eq!(audit.with_action(Action::Decide).len(), 5);
    assert!(audit.with_action(Action::Undelivered).is_empty());

    for node in cluster.nodes() {
        assert_eq!(node.decision(), Some(decision.clone()));
        let state = node.acceptor_state();
        assert_eq!(state.promised, Some(decision.ballot));
        assert_eq!(
            state.accepted,
            Some(Proposal::new(decision.ballot, "v1"))
        );
    }
}

/// A lone node is its own quorum.
#[tokio::test]
async fn single_node_decides_alone() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(1);
    assert_eq!(cluster.view().quorum_size(), 1);

    let node = cluster.node(n(1)).unwrap();
    let decision = propose(node, "solo", 0, TIMEOUT).await.unwrap();
    assert_eq!(decision.value, "solo");
    assert_eq!(decision.ballot, Ballot::new(1, n(1)));
    assert_eq!(node.decision(), Some(decision));

    assert_eq!(audit.with_action(Action::PromiseSend).len(), 1);
    assert_eq!(audit.with_action(Action::AcceptedSend).len(), 1);
    assert_eq!(audit.with_action(Action::Decide).len(), 1);
}

/// Two of five down: the remaining three are still a quorum.
#[tokio::test]
async fn scenario_b_minority_down() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(5);
    cluster.view().set_liveness(n(4), Liveness::Down).unwrap();
    cluster.view().set_liveness(n(5), Liveness::Down).unwrap();

    let decision = propose(cluster.node(n(1)).unwrap(), "survive", 0, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(decision.value, "survive");

    assert_eq!(audit.with_action(Action::PromiseSend).len(), 3);
    assert_eq!(audit.with_action(Action::AcceptedSend).len(), 3);
    // Prepare, Accept and Decide each refused for nodes 4 and 5
    let undelivered = audit.with_action(Action::Undelivered);
    assert_eq!(undelivered.len(), 6);
    assert!(undelivered.iter().all(|e| e.to.liveness == Liveness::Down));

    // Down nodes keep their (empty) state and learn nothing
    for id in [4, 5] {
        let node = cluster.node(n(id)).unwrap();
        assert_eq!(node.acceptor_state().promised, None);
        assert_eq!(node.decision(), None);
    }
    assert_eq!(agreed_value(&cluster), Some("survive"));
}

/// Three of five down: no quorum on any attempt.
#[tokio::test(start_paused = true)]
async fn scenario_c_majority_down() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(5);
    for id in [3, 4, 5] {
        cluster.view().set_liveness(n(id), Liveness::Down).unwrap();
    }

    let err = propose(cluster.node(n(1)).unwrap(), "x", 2, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.current_context(), &ProposeError::QuorumUnavailable);
    assert!(format!("{err:?}").contains("gave up after 3 attempts"));

    // Three attempts, each reaching only nodes 1 and 2
    assert_eq!(audit.with_action(Action::PrepareSend).len(), 6);
    assert_eq!(audit.with_action(Action::PromiseSend).len(), 6);
    assert_eq!(audit.with_action(Action::Undelivered).len(), 9);
    assert!(audit.with_action(Action::AcceptSend).is_empty());
    assert_eq!(agreed_value(&cluster), None);

    // Fault healed: the next call succeeds
    cluster.view().set_liveness(n(3), Liveness::Up).unwrap();
    assert_eq!(cluster.view().liveness(n(3)), Some(Liveness::Up));
    assert_eq!(cluster.view().liveness(n(4)), Some(Liveness::Down));
    let decision = propose(cluster.node(n(1)).unwrap(), "x", 0, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(decision.value, "x");
    assert!(decision.ballot > Ballot::new(3, n(1)));
}

/// Node 2's Prepare lands between node 1's Prepare and Accept.
#[tokio::test]
async fn scenario_d_competing_proposers() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(5);
    let bus = cluster.bus();
    let members = cluster.view().members();
    let (n1, n2) = (cluster.node(n(1)).unwrap(), cluster.node(n(2)).unwrap());

    let b1 = n1.mint_ballot().unwrap();
    assert_eq!(b1, Ballot::new(1, n(1)));
    for &to in &members {
        let response = bus.send(n1.id(), to, Request::Prepare(b1)).await.unwrap();
        assert!(matches!(response, Response::Promise { accepted: None, .. }));
    }

    let b2 = n2.mint_ballot().unwrap();
    assert_eq!(b2, Ballot::new(2, n(2)));
    for &to in &members {
        let response = bus.send(n2.id(), to, Request::Prepare(b2)).await.unwrap();
        assert!(matches!(response, Response::Promise { .. }));
    }

    for &to in &members {
        let response = bus
            .send(n1.id(), to, Request::Accept(Proposal::new(b1, "a")))
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::Reject {
                ballot: b1,
                promised: b2
            }
        );
    }
    assert_eq!(audit.with_action(Action::AcceptReject).len(), 5);

    // Node 1 retries above what it has seen
    let decision = propose(n1, "a", 3, TIMEOUT).await.unwrap();
    assert!(decision.ballot > b2);
    assert_eq!(decision.value, "a");

    // Node 2 can only confirm it
    let decision = propose(n2, "b", 3, TIMEOUT).await.unwrap();
    assert_eq!(decision.value, "a");
    assert_eq!(agreed_value(&cluster), Some("a"));
}

/// Two proposers racing for real: one value wins everywhere.
#[tokio::test]
async fn scenario_d_concurrent_proposals_agree() {
    let _guard = init_tracing();
    let cluster: Cluster<Value> = Cluster::uniform(5);
    let (n1, n2) = (cluster.node(n(1)).unwrap(), cluster.node(n(2)).unwrap());

    let (a, b) = tokio::join!(propose(n1, "a", 10, TIMEOUT), propose(n2, "b", 10, TIMEOUT));
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.value, b.value);
    assert_eq!(agreed_value(&cluster), Some(a.value));
}

/// A later proposer must carry the decided value forward.
#[tokio::test]
async fn scenario_e_value_preserved() {
    let _guard = init_tracing();
    let (cluster, _audit) = audited(5);
    let bus = cluster.bus();
    let (n1, n2) = (cluster.node(n(1)).unwrap(), cluster.node(n(2)).unwrap());

    let first = propose(n1, "v1", 0, TIMEOUT).await.unwrap();
    assert_eq!(first.ballot, Ballot::new(1, n(1)));

    let b2 = Ballot::new(2, n(2));
    n2.observe(b2);
    for to in cluster.view().members() {
        let response = bus.send(n2.id(), to, Request::Prepare(b2)).await.unwrap();
        assert_eq!(
            response,
            Response::Promise {
                ballot: b2,
                accepted: Some(Proposal::new(first.ballot, "v1")),
            }
        );
    }

    let second = propose(n2, "mine", 0, TIMEOUT).await.unwrap();
    assert_eq!(second.value, "v1");
    assert!(second.ballot > b2);
}

/// Only part of the cluster accepted before the proposer vanished; a new
/// proposer still finds and finishes that value.
#[tokio::test]
async fn partially_accepted_value_is_finished() {
    let _guard = init_tracing();
    let cluster: Cluster<Value> = Cluster::uniform(5);
    let bus = cluster.bus();
    let n1 = cluster.node(n(1)).unwrap();

    let b1 = n1.mint_ballot().unwrap();
    for to in [n(1), n(2), n(3)] {
        bus.send(n1.id(), to, Request::Prepare(b1)).await.unwrap();
    }
    // Accepted by a single acceptor only
    bus.send(n1.id(), n(3), Request::Accept(Proposal::new(b1, "orphan")))
        .await
        .unwrap();

    // With nodes 1 and 4 gone, node 5's only quorum is {2, 3, 5}
    cluster.view().set_liveness(n(1), Liveness::Down).unwrap();
    cluster.view().set_liveness(n(4), Liveness::Down).unwrap();
    let decision = propose(cluster.node(n(5)).unwrap(), "fresh", 0, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(decision.value, "orphan");
}

/// Replayed Accept and Decide messages leave every record unchanged.
#[tokio::test]
async fn replays_are_idempotent() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(3);
    let bus = cluster.bus();
    let decision = propose(cluster.node(n(1)).unwrap(), "v1", 0, TIMEOUT)
        .await
        .unwrap();
    let decided = Proposal::new(decision.ballot, "v1");
    let decides = audit.with_action(Action::Decide).len();

    for to in cluster.view().members() {
        let before = cluster.node(to).unwrap().acceptor_state();
        let response = bus
            .send(n(1), to, Request::Accept(decided.clone()))
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::Accepted {
                ballot: decision.ballot
            }
        );
        assert_eq!(cluster.node(to).unwrap().acceptor_state(), before);

        let response = bus
            .send(n(1), to, Request::Decide(decided.clone()))
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::Learned {
                decided: Some(decision.clone())
            }
        );
    }
    assert_eq!(audit.with_action(Action::Decide).len(), decides);

    // A conflicting decide is refused, not recorded
    let bogus = Proposal::new(Ballot::new(99, n(3)), "other");
    let response = bus.send(n(3), n(2), Request::Decide(bogus)).await.unwrap();
    assert_eq!(
        response,
        Response::Learned {
            decided: Some(decision.clone())
        }
    );
    assert_eq!(agreed_value(&cluster), Some("v1"));
}

/// Many proposers on a multi-threaded runtime never split the decision.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_proposers_agree() {
    let _guard = init_tracing();
    let cluster: Cluster<Value> = Cluster::uniform(5);
    let values = ["a", "b", "c", "d", "e"];

    let mut tasks = tokio::task::JoinSet::new();
    for (id, value) in (1..=5).zip(values) {
        let node = cluster.node(n(id)).unwrap().clone();
        tasks.spawn(async move { propose(&node, value, 20, TIMEOUT).await });
    }

    let mut decided = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(decision) = result.unwrap() {
            decided.push(decision.value);
        }
    }
    assert!(!decided.is_empty(), "no proposer succeeded");
    assert!(decided.iter().all(|v| *v == decided[0]));
    assert!(values.contains(&decided[0]));
    assert_eq!(agreed_value(&cluster), Some(decided[0]));
}

/// Retries exhausted against a higher promise surface as `Preempted`.
#[tokio::test]
async fn preempted_after_retry_budget() {
    let _guard = init_tracing();
    let proposer_only: Roles = [Role::Proposer, Role::Learner].into_iter().collect();
    let view = ClusterView::new([
        (n(1), proposer_only),
        (n(2), Roles::ALL),
        (n(3), Roles::ALL),
        (n(4), Roles::ALL),
    ]);
    let (cluster, audit) = audited_view(view);
    assert_eq!(cluster.view().quorum_size(), 2);

    let high = Ballot::new(10, n(2));
    for to in cluster.view().members_with(Role::Acceptor) {
        cluster
            .bus()
            .send(n(2), to, Request::Prepare(high))
            .await
            .unwrap();
    }

    let n1 = cluster.node(n(1)).unwrap();
    let err = propose(n1, "late", 0, TIMEOUT).await.unwrap_err();
    assert_eq!(err.current_context(), &ProposeError::Preempted);
    assert!(!audit.with_action(Action::PrepareReject).is_empty());

    // The rejection taught node 1 where to start next time
    let decision = propose(n1, "late", 0, TIMEOUT).await.unwrap();
    assert_eq!(decision.ballot, Ballot::new(11, n(1)));
    assert_eq!(decision.value, "late");
}

/// An expired timer abandons the round before anything is sent.
#[tokio::test]
async fn round_timeout_gives_up() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(3);
    let node = cluster.node(n(1)).unwrap();

    let config = ProposerConfig::with_seed(1, TIMEOUT, BackoffConfig::none(), Expired, 7);
    let err = node.proposer(config).unwrap().propose("v").await.unwrap_err();
    assert_eq!(err.current_context(), &ProposeError::QuorumUnavailable);
    assert!(format!("{err:?}").contains("prepare: 0 of 2"));

    assert!(audit.events().is_empty());
    for node in cluster.nodes() {
        assert_eq!(node.acceptor_state().promised, None);
    }
}

/// A node only proposes if it holds the role.
#[tokio::test]
async fn proposing_requires_role() {
    let _guard = init_tracing();
    let view = ClusterView::new([
        (n(1), Roles::ALL),
        (n(2), Roles::ALL),
        (n(3), Roles::from(Role::Learner)),
    ]);
    let cluster: Cluster<Value> = Cluster::start(view, Arc::new(TracingSink));

    let err = propose(cluster.node(n(3)).unwrap(), "v", 0, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.current_context(), &ProposeError::NotProposer);

    // The learner-only member is outside the quorum but still learns
    let decision = propose(cluster.node(n(1)).unwrap(), "v", 0, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(
        cluster.node(n(3)).unwrap().wait_for_decision().await,
        Some(decision)
    );
}

/// A blocked proposer reaches nobody.
#[tokio::test(start_paused = true)]
async fn blocked_proposer_cannot_decide() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(3);
    cluster.view().set_liveness(n(1), Liveness::Blocked).unwrap();

    let err = propose(cluster.node(n(1)).unwrap(), "v", 1, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.current_context(), &ProposeError::QuorumUnavailable);
    let undelivered = audit.with_action(Action::Undelivered);
    assert_eq!(undelivered.len(), 6);
    assert!(
        undelivered
            .iter()
            .all(|e| e.from.liveness == Liveness::Blocked)
    );
    assert!(audit.with_action(Action::PromiseSend).is_empty());
}

/// Events reach a channel consumer in record order.
#[tokio::test]
async fn channel_sink_streams_events() {
    let _guard = init_tracing();
    let (sink, mut events) = ChannelSink::new();
    let cluster: Cluster<Value> = Cluster::start(ClusterView::uniform(3), Arc::new(sink));

    let decision = propose(cluster.node(n(2)).unwrap(), "v", 0, TIMEOUT)
        .await
        .unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!(first.action, Action::PrepareSend);
    assert_eq!(first.from.id, n(2));
    assert_eq!(first.round, decision.ballot.sequence);
    assert!(first.from.roles.contains(Role::Proposer));

    let mut decides = 0;
    while let Ok(event) = events.try_recv() {
        if event.action == Action::Decide {
            assert!(event.consensus_reached);
            assert_eq!(event.consensus_value, Some("v"));
            decides += 1;
        }
    }
    assert_eq!(decides, 3);
}

/// Holds one acceptor's promise until the test releases it.
struct StallPromise {
    from: NodeId,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl AuditSink<Value> for StallPromise {
    fn record(&self, event: AuditEvent<Value>) {
        if event.action == Action::PromiseSend && event.from.id == self.from {
            let gate = self.gate.lock().unwrap();
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
    }
}

/// The real timer ends a round while a request is still outstanding.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_timer_fires_with_request_outstanding() {
    let _guard = init_tracing();
    let (release, gate) = mpsc::channel();
    let sink = StallPromise {
        from: n(3),
        gate: Mutex::new(gate),
    };
    let cluster: Cluster<Value> = Cluster::start(ClusterView::uniform(3), Arc::new(sink));
    cluster.view().set_liveness(n(2), Liveness::Down).unwrap();

    let timeout = Duration::from_millis(50);
    let started = Instant::now();
    let err = propose(cluster.node(n(1)).unwrap(), "v", 0, timeout)
        .await
        .unwrap_err();
    assert!(started.elapsed() >= timeout);
    assert_eq!(err.current_context(), &ProposeError::QuorumUnavailable);
    // Node 1 promised, node 3 had not answered yet
    assert!(format!("{err:?}").contains("prepare: 1 of 2"));

    release.send(()).unwrap();
}

/// Once the last sequence number has been seen, no ballot can be minted.
#[tokio::test]
async fn ballots_run_out_at_the_last_sequence() {
    let _guard = init_tracing();
    let (cluster, audit) = audited(3);
    let node = cluster.node(n(1)).unwrap();

    node.observe(Ballot::new(u64::MAX, n(2)));
    assert_eq!(node.mint_ballot(), None);

    let err = propose(node, "v", 2, TIMEOUT).await.unwrap_err();
    assert_eq!(err.current_context(), &ProposeError::BallotsExhausted);
    assert!(audit.events().is_empty());

    // Other nodes are unaffected
    let decision = propose(cluster.node(n(2)).unwrap(), "v", 0, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(decision.ballot, Ballot::new(1, n(2)));
}
