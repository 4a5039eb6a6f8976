use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace};

use crate::config::ScpConfig;
use crate::error::ScpError;
use crate::packet::{peek_seq_num, CoreAddr, ScpRequest, ScpResponse};
use crate::send_pipeline::SendPipeline;
use crate::slot::{CmdResult, QueuedRequest, SlotPool};

/// One logical channel to one remote SCP endpoint: the slot pool, the request
///  backlog, the sequence-number space and the socket all live here.
///
/// All requests issued on a connection share its timeout / retry / data-length
///  parameters; changing them means opening a new connection.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct ConnectionShared {
    config: ScpConfig,
    pipeline: SendPipeline,
    state: Mutex<ConnectionState>,
    /// number of active slots, for the teardown drain
    active_slots: watch::Sender<usize>,
}

struct ConnectionState {
    pool: SlotPool,
    queue: VecDeque<QueuedRequest>,
    next_seq_num: u16,
    closing: bool,
}

impl ConnectionState {
    /// Next sequence number that is not assigned to an active slot. The pool is
    ///  far smaller than the sequence space, so this terminates quickly.
    fn next_free_seq_num(&mut self) -> u16 {
        loop {
            let seq_num = self.next_seq_num;
            self.next_seq_num = self.next_seq_num.wrapping_add(1);
            if !self.pool.is_active_seq_num(seq_num) {
                return seq_num;
            }
        }
    }
}

impl Connection {
    /// Open a connection to the given remote endpoint: bind an ephemeral local
    ///  socket, connect it so the kernel filters other traffic, and start the
    ///  receive loop.
    pub async fn open(remote_addr: SocketAddr, config: ScpConfig) -> anyhow::Result<Connection> {
        config.validate()?;

        let bind_addr: SocketAddr = if remote_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        }
        else {
            "[::]:0".parse()?
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(remote_addr).await?;
        info!("bound {:?} for SCP endpoint {:?}", socket.local_addr()?, remote_addr);

        let shared = Arc::new(ConnectionShared::new(
            SendPipeline::new(Arc::new(socket.clone()), remote_addr),
            config,
        ));

        let recv_shared = shared.clone();
        let recv_task = tokio::spawn(async move {
            recv_shared.recv_loop(socket).await;
        });

        Ok(Connection {
            shared,
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    /// Test constructor: no socket, no receive loop; datagrams are injected
    ///  through [Connection::inject_datagram].
    #[cfg(test)]
    pub(crate) fn with_pipeline(pipeline: SendPipeline, config: ScpConfig) -> Connection {
        Connection {
            shared: Arc::new(ConnectionShared::new(pipeline, config)),
            recv_task: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_datagram(&self, datagram: &[u8]) {
        self.shared.handle_datagram(datagram);
    }

    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    pub fn config(&self) -> &ScpConfig {
        &self.shared.config
    }

    /// Issue a generic SCP command and wait for its outcome: either the decoded
    ///  response (whatever its result code - interpreting it is the caller's
    ///  concern) or a terminal transport error.
    ///
    /// If all slots are busy the request waits in the FIFO backlog; that is the
    ///  engine's only flow-control mechanism.
    pub async fn command(
        &self,
        dest: CoreAddr,
        cmd: u16,
        args: &[u32],
        payload: &[u8],
    ) -> Result<ScpResponse, ScpError> {
        let rx = self.shared.submit(dest, cmd, args.to_vec(), payload.to_vec())?;
        rx.await.unwrap_or(Err(ScpError::ConnectionClosed))
    }

    /// Tear the connection down: fail everything still queued, cancel active
    ///  requests, then wait until every slot driver has seen its pending send
    ///  complete before releasing the socket. Safe to call more than once.
    pub async fn close(&self) {
        let drained = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.closing {
                debug!("closing connection to {:?}", self.shared.pipeline.remote_addr());
            }
            state.closing = true;
            state.pool.cancel_all();
            std::mem::take(&mut state.queue)
        };
        for request in drained {
            let _ = request.result_tx.send(Err(ScpError::ConnectionClosed));
        }

        // drain-before-destroy: a slot buffer may still be referenced by an
        //  in-flight send; its driver releases the slot once the send completes
        let mut active = self.shared.active_slots.subscribe();
        let _ = active.wait_for(|&n| n == 0).await;

        let recv_task = self.recv_task.lock().unwrap().take();
        if let Some(handle) = recv_task {
            handle.abort();
        }
    }
}

/// Backstop for handles dropped without [Connection::close]: the receive task
///  holds its own `Arc`s to the shared state and the socket, so without the
///  abort it would outlive the connection for the rest of the process.
impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut recv_task) = self.recv_task.lock() {
            if let Some(handle) = recv_task.take() {
                handle.abort();
            }
        }
    }
}

impl ConnectionShared {
    fn new(pipeline: SendPipeline, config: ScpConfig) -> ConnectionShared {
        let n_outstanding = config.n_outstanding;
        ConnectionShared {
            config,
            pipeline,
            state: Mutex::new(ConnectionState {
                pool: SlotPool::new(n_outstanding),
                queue: VecDeque::new(),
                next_seq_num: 0,
                closing: false,
            }),
            active_slots: watch::Sender::new(0),
        }
    }

    /// Enqueue a request and attempt admission. Returns the receiving end of its
    ///  single-fire completion channel; a dropped sender means the connection went
    ///  away before the request ran.
    pub(crate) fn submit(
        self: &Arc<Self>,
        dest: CoreAddr,
        cmd: u16,
        args: Vec<u32>,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<CmdResult>, ScpError> {
        if args.len() > ScpResponse::MAX_ARGS {
            return Err(ScpError::TooManyArgs(args.len()));
        }
        if payload.len() > self.config.scp_data_length {
            return Err(ScpError::PayloadTooLong {
                len: payload.len(),
                max: self.config.scp_data_length,
            });
        }

        let (result_tx, result_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.closing {
                return Err(ScpError::ConnectionClosed);
            }
            state.queue.push_back(QueuedRequest {
                dest,
                cmd,
                args,
                payload,
                result_tx,
            });
        }
        self.admit_pending();
        Ok(result_rx)
    }

    /// Drain the backlog into free slots, FIFO, until one of the two runs out.
    ///  Called after every enqueue and after every slot release.
    fn admit_pending(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            while state.pool.has_free() && !state.queue.is_empty() {
                let request = state.queue.pop_front().unwrap();
                let seq_num = state.next_free_seq_num();
                let (slot_idx, response_rx) = state.pool.activate(seq_num)
                    .expect("this is a bug: admission checked for a free slot");

                let packet = ScpRequest {
                    dest: request.dest,
                    cmd: request.cmd,
                    args: &request.args,
                    seq_num,
                    payload: &request.payload,
                }.encode().freeze();

                trace!("admitting request cmd {} as seq {} into slot {}", request.cmd, seq_num, slot_idx);
                admitted.push((slot_idx, seq_num, packet, response_rx, request.result_tx));
            }
            self.active_slots.send_replace(state.pool.active_count());
        }

        for (slot_idx, seq_num, packet, response_rx, result_tx) in admitted {
            let shared = self.clone();
            tokio::spawn(async move {
                shared.drive_slot(slot_idx, seq_num, packet, response_rx, result_tx).await;
            });
        }
    }

    /// One slot's whole active life: the retry/timeout state machine, then the
    ///  release that offers the freed slot to the backlog.
    async fn drive_slot(
        self: Arc<Self>,
        slot_idx: usize,
        seq_num: u16,
        packet: Bytes,
        mut response_rx: oneshot::Receiver<ScpResponse>,
        result_tx: oneshot::Sender<CmdResult>,
    ) {
        let outcome = self.run_attempts(seq_num, &packet, &mut response_rx).await;

        {
            let mut state = self.state.lock().unwrap();
            state.pool.release(slot_idx);
            self.active_slots.send_replace(state.pool.active_count());
        }

        let _ = result_tx.send(outcome);

        // the freed slot may admit the next queued request
        self.admit_pending();
    }

    /// Up to `max_retries + 1` transmissions of the same packet, one armed timer
    ///  per attempt. A response racing the timer wins: the timeout polls the
    ///  response future first.
    async fn run_attempts(
        &self,
        seq_num: u16,
        packet: &Bytes,
        response_rx: &mut oneshot::Receiver<ScpResponse>,
    ) -> CmdResult {
        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            trace!("seq {}: transmission attempt {}/{}", seq_num, attempt, attempts);
            if let Err(e) = self.pipeline.send_packet(packet).await {
                debug!("seq {}: send failed: {}", seq_num, e);
                return Err(ScpError::TransmissionFailure(e.to_string()));
            }

            // the send has completed and the buffer is ours again; teardown that
            //  started mid-send surfaces here
            if self.state.lock().unwrap().closing {
                return Err(ScpError::ConnectionClosed);
            }

            match time::timeout(self.config.timeout, &mut *response_rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => return Err(ScpError::ConnectionClosed),
                Err(_elapsed) => {
                    debug!("seq {}: no response within {:?}", seq_num, self.config.timeout);
                }
            }
        }
        Err(ScpError::Timeout { attempts })
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; self.config.max_response_len()];
        loop {
            let num_read = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    // receive errors are rare and hard to interpret; skipping them
                    //  is safe on an unreliable channel
                    error!("socket error: {}", e);
                    continue;
                }
            };
            self.handle_datagram(&buf[..num_read]);
        }
    }

    /// The response demultiplexer. Every drop in here is silent by design:
    ///  garbage, stray, duplicate and late datagrams are expected noise.
    fn handle_datagram(&self, datagram: &[u8]) {
        let Some(seq_num) = peek_seq_num(datagram) else {
            debug!("datagram of {} bytes is too short for an SCP packet - dropping", datagram.len());
            return;
        };
        let response = match ScpResponse::decode(datagram) {
            Ok(response) => response,
            Err(_) => {
                debug!("datagram with seq {} has a garbled header - dropping", seq_num);
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        if !state.pool.route_response(seq_num, response) {
            trace!("response with seq {} matches no active slot - dropping", seq_num);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ResultCode;
    use crate::send_pipeline::MockSendSocket;
    use bytes::{BufMut, BytesMut};
    use rstest::*;
    use std::time::Duration;
    use tokio::runtime::Builder;

    fn test_config(n_outstanding: usize, max_retries: u32) -> ScpConfig {
        ScpConfig {
            scp_data_length: 16,
            timeout: Duration::from_millis(100),
            max_retries,
            n_outstanding,
        }
    }

    const DEST: CoreAddr = CoreAddr { x: 0, y: 0, cpu: 1 };

    /// mock socket that records every sent packet
    fn recording_socket(sent: Arc<Mutex<Vec<Vec<u8>>>>) -> MockSendSocket {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .returning(move |_, buf| {
                sent.lock().unwrap().push(buf.to_vec());
                Ok(())
            });
        socket
    }

    fn recording_connection(config: ScpConfig) -> (Connection, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let socket = recording_socket(sent.clone());
        let conn = Connection::with_pipeline(
            SendPipeline::new(Arc::new(socket), SocketAddr::from(([127, 0, 0, 1], 17893))),
            config,
        );
        (conn, sent)
    }

    fn ok_response_for(sent_packet: &[u8], payload: &[u8]) -> Vec<u8> {
        let seq_num = peek_seq_num(sent_packet).unwrap();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 0]); // x, y, cpu, n_args
        buf.put_u16(0);
        buf.put_u16(ResultCode::Ok.into());
        buf.put_u16(seq_num);
        buf.put_slice(payload);
        buf.to_vec()
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    /// respond to every newly sent packet with an Ok response carrying the given payload
    async fn auto_respond(conn: &Connection, sent: &Arc<Mutex<Vec<Vec<u8>>>>, payload: &[u8]) {
        let mut num_answered = 0;
        loop {
            time::sleep(Duration::from_millis(1)).await;
            let packets = sent.lock().unwrap().clone();
            for packet in &packets[num_answered..] {
                conn.inject_datagram(&ok_response_for(packet, payload));
            }
            num_answered = packets.len();
        }
    }

    #[test]
    fn test_command_completes_on_response() {
        let (conn, sent) = recording_connection(test_config(2, 2));
        paused_rt().block_on(async move {
            let response = tokio::select! {
                r = conn.command(DEST, 5, &[1, 2], &[9, 9]) => r,
                _ = auto_respond(&conn, &sent, &[7, 7, 7]) => unreachable!(),
            }.unwrap();

            assert_eq!(response.rc, ResultCode::Ok);
            assert_eq!(response.payload, vec![7, 7, 7]);

            // answered on the first attempt, so the timer never fired a retransmission
            assert_eq!(sent.lock().unwrap().len(), 1);
        });
    }

    #[test]
    fn test_lost_responses_fail_after_all_attempts() {
        let (conn, sent) = recording_connection(test_config(1, 2));
        paused_rt().block_on(async move {
            let started = time::Instant::now();
            let result = conn.command(DEST, 5, &[], &[]).await;

            assert_eq!(result, Err(ScpError::Timeout { attempts: 3 }));
            assert!(started.elapsed() >= 3 * Duration::from_millis(100));

            // same packet, same seq number, every time
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 3);
            assert_eq!(sent[0], sent[1]);
            assert_eq!(sent[1], sent[2]);
        });
    }

    #[test]
    fn test_send_error_is_terminal() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .times(1)
            .returning(|_, _| Err(std::io::Error::new(std::io::ErrorKind::Other, "no route")));

        let conn = Connection::with_pipeline(
            SendPipeline::new(Arc::new(socket), SocketAddr::from(([127, 0, 0, 1], 17893))),
            test_config(1, 5),
        );
        paused_rt().block_on(async move {
            let result = conn.command(DEST, 5, &[], &[]).await;
            assert!(matches!(result, Err(ScpError::TransmissionFailure(_))));
        });
    }

    #[test]
    fn test_concurrency_bound_and_fifo_admission() {
        let (conn, sent) = recording_connection(test_config(2, 0));
        paused_rt().block_on(async move {
            // submit five requests against a bound of two; commands 10..=14 in order
            let pending: Vec<_> = (0..5u16)
                .map(|i| conn.shared().submit(DEST, 10 + i, vec![], vec![]).unwrap())
                .collect();

            time::sleep(Duration::from_millis(1)).await;
            {
                let sent = sent.lock().unwrap();
                assert_eq!(sent.len(), 2, "only the slot-pool bound may be in flight");
                assert_eq!(u16::from_be_bytes([sent[0][4], sent[0][5]]), 10);
                assert_eq!(u16::from_be_bytes([sent[1][4], sent[1][5]]), 11);
            }

            // completing the first admits the third, not the fourth or fifth
            let first = sent.lock().unwrap()[0].clone();
            conn.inject_datagram(&ok_response_for(&first, &[]));
            time::sleep(Duration::from_millis(1)).await;
            {
                let sent = sent.lock().unwrap();
                assert_eq!(sent.len(), 3);
                assert_eq!(u16::from_be_bytes([sent[2][4], sent[2][5]]), 12);
            }

            // let the rest drain so the pending results resolve
            let results = tokio::select! {
                r = async {
                    let mut results = Vec::new();
                    for rx in pending {
                        results.push(rx.await.unwrap());
                    }
                    results
                } => r,
                _ = auto_respond(&conn, &sent, &[]) => unreachable!(),
            };
            assert!(results.iter().all(|r| r.is_ok()));
        });
    }

    #[test]
    fn test_response_between_retries() {
        let (conn, sent) = recording_connection(test_config(1, 3));
        paused_rt().block_on(async move {
            let respond_late = async {
                // past the first timeout, within the second attempt's window
                time::sleep(Duration::from_millis(150)).await;
                let retransmitted = sent.lock().unwrap().last().unwrap().clone();
                conn.inject_datagram(&ok_response_for(&retransmitted, &[1]));
                std::future::pending::<()>().await;
            };

            let response = tokio::select! {
                r = conn.command(DEST, 5, &[], &[]) => r,
                _ = respond_late => unreachable!(),
            }.unwrap();

            assert_eq!(response.payload, vec![1]);
            assert_eq!(sent.lock().unwrap().len(), 2);
        });
    }

    #[rstest]
    #[case::too_short(vec![1, 2, 3])]
    #[case::empty(vec![])]
    #[case::unknown_seq(vec![0,0,0, 0, 0,0, 0,0x80, 0xff,0xfe])]
    #[case::garbled_args(vec![0,0,0, 7, 0,0, 0,0x80, 0,0])]
    fn test_noise_causes_no_completion(#[case] noise: Vec<u8>) {
        let (conn, sent) = recording_connection(test_config(1, 1));
        paused_rt().block_on(async move {
            let command = conn.command(DEST, 5, &[], &[]);
            let inject = async {
                time::sleep(Duration::from_millis(10)).await;
                conn.inject_datagram(&noise);
                std::future::pending::<()>().await;
            };

            // the command must run its full retry schedule and time out
            let result = tokio::select! {
                r = command => r,
                _ = inject => unreachable!(),
            };
            assert_eq!(result, Err(ScpError::Timeout { attempts: 2 }));
            assert_eq!(sent.lock().unwrap().len(), 2);
        });
    }

    #[rstest]
    #[case::no_args(0)]
    #[case::max_args(3)]
    fn test_arg_count_accepted(#[case] n_args: usize) {
        let (conn, _sent) = recording_connection(test_config(1, 0));
        paused_rt().block_on(async move {
            let args = vec![0u32; n_args];
            assert!(conn.shared().submit(DEST, 1, args, vec![]).is_ok());
        });
    }

    #[test]
    fn test_validation_rejects_before_enqueue() {
        let (conn, sent) = recording_connection(test_config(1, 0));
        paused_rt().block_on(async move {
            assert_eq!(
                conn.command(DEST, 1, &[1, 2, 3, 4], &[]).await,
                Err(ScpError::TooManyArgs(4))
            );
            assert_eq!(
                conn.command(DEST, 1, &[], &[0u8; 17]).await,
                Err(ScpError::PayloadTooLong { len: 17, max: 16 })
            );
            assert!(sent.lock().unwrap().is_empty());
        });
    }

    #[test]
    fn test_close_fails_outstanding_and_queued() {
        let (conn, sent) = recording_connection(test_config(1, 9));
        paused_rt().block_on(async move {
            let in_flight = conn.shared().submit(DEST, 1, vec![], vec![]).unwrap();
            let queued = conn.shared().submit(DEST, 2, vec![], vec![]).unwrap();
            time::sleep(Duration::from_millis(1)).await;
            assert_eq!(sent.lock().unwrap().len(), 1);

            conn.close().await;

            assert_eq!(in_flight.await.unwrap(), Err(ScpError::ConnectionClosed));
            assert_eq!(queued.await.unwrap(), Err(ScpError::ConnectionClosed));

            // the queued request never reached the wire, and nothing was retried
            assert_eq!(sent.lock().unwrap().len(), 1);

            // closing is idempotent-safe, and later submissions are refused
            conn.close().await;
            assert_eq!(
                conn.shared().submit(DEST, 3, vec![], vec![]).err(),
                Some(ScpError::ConnectionClosed)
            );
        });
    }

    /// send socket whose completion notification arrives only after a delay,
    ///  modelling a send operation that is still in flight
    struct SlowSocket {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl crate::send_pipeline::SendSocket for SlowSocket {
        async fn do_send_packet(&self, _to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
            time::sleep(self.delay).await;
            self.sent.lock().unwrap().push(packet_buf.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_close_waits_for_in_flight_send() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let socket = SlowSocket {
            sent: sent.clone(),
            delay: Duration::from_millis(50),
        };
        let conn = Connection::with_pipeline(
            SendPipeline::new(Arc::new(socket), SocketAddr::from(([127, 0, 0, 1], 17893))),
            test_config(1, 3),
        );
        paused_rt().block_on(async move {
            let in_flight = conn.shared().submit(DEST, 1, vec![], vec![]).unwrap();

            // let the driver park inside its pending send
            time::sleep(Duration::from_millis(1)).await;
            assert!(sent.lock().unwrap().is_empty());

            let close_started = time::Instant::now();
            conn.close().await;

            // release was deferred until the pending send completed
            assert!(close_started.elapsed() >= Duration::from_millis(49));
            assert_eq!(sent.lock().unwrap().len(), 1);

            // the request resolves exactly once, with the teardown outcome, and
            //  is never retried after the send completes
            assert_eq!(in_flight.await.unwrap(), Err(ScpError::ConnectionClosed));
            assert_eq!(sent.lock().unwrap().len(), 1);
        });
    }

    #[test]
    fn test_drop_aborts_receive_task() {
        paused_rt().block_on(async move {
            let (alive_tx, alive_rx) = oneshot::channel::<()>();
            let recv_task = tokio::spawn(async move {
                let _alive_tx = alive_tx;
                std::future::pending::<()>().await
            });

            let (conn, _sent) = recording_connection(test_config(1, 0));
            *conn.recv_task.lock().unwrap() = Some(recv_task);

            drop(conn);

            // the sender is dropped only when the task is torn down
            let torn_down = time::timeout(Duration::from_secs(1), alive_rx).await;
            assert!(matches!(torn_down, Ok(Err(_))));
        });
    }

    #[test]
    fn test_seq_nums_unique_among_active() {
        let (conn, sent) = recording_connection(test_config(4, 0));
        paused_rt().block_on(async move {
            for i in 0..4u16 {
                let _ = conn.shared().submit(DEST, i, vec![], vec![]).unwrap();
            }
            time::sleep(Duration::from_millis(1)).await;

            let sent = sent.lock().unwrap();
            let mut seq_nums: Vec<u16> = sent.iter()
                .map(|p| peek_seq_num(p).unwrap())
                .collect();
            assert_eq!(seq_nums.len(), 4);
            seq_nums.sort_unstable();
            seq_nums.dedup();
            assert_eq!(seq_nums.len(), 4);
        });
    }
}
