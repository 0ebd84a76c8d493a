#[cfg(test)]
mod conn_test;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use portable_atomic::AtomicBool;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use util::Conn;

use crate::config::Config;
use crate::crypto::*;
use crate::handshake::*;
use crate::record::*;
use crate::{Error, Result, EXTRACTOR_LABEL, SRTP_PROFILE_AES128_CM_SHA1_80};

/// The handshake is retried a bounded number of times and only the
/// client re-initiates; the server answers repeats.
const RETRANSMIT_BUDGET: u32 = 3;
const FLIGHT_TIMEOUT: Duration = Duration::from_secs(2);

const ALERT_LEVEL_FATAL: u8 = 2;
const ALERT_CLOSE_NOTIFY: u8 = 0;

struct TxState {
    cipher: Option<CipherState>,
    epoch: u16,
    seq_epoch0: u64,
    seq_epoch1: u64,
}

struct RxState {
    cipher: Option<CipherState>,
    rx_epoch1: bool,
    early_app_data: VecDeque<Vec<u8>>,
}

/// DtlsConn is an established DTLS 1.2 connection carrying
/// application data (the data channel) and exporting SRTP keys.
pub struct DtlsConn {
    conn: Arc<dyn Conn + Send + Sync>,
    is_client: bool,
    master_secret: Vec<u8>,
    client_random: [u8; RANDOM_LENGTH],
    server_random: [u8; RANDOM_LENGTH],
    peer_certificate: Vec<u8>,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    closed: AtomicBool,
}

impl DtlsConn {
    /// handshake drives the whole exchange over `conn` and returns
    /// the established connection.
    pub async fn handshake(config: Config, conn: Arc<dyn Conn + Send + Sync>) -> Result<Self> {
        let mut hs = Handshaker::new(config, Arc::clone(&conn));

        let outcome = if hs.is_client {
            hs.run_client().await?
        } else {
            hs.run_server().await?
        };

        Ok(DtlsConn {
            conn,
            is_client: hs.is_client,
            master_secret: outcome.master_secret,
            client_random: outcome.client_random,
            server_random: outcome.server_random,
            peer_certificate: outcome.peer_certificate,
            tx: Mutex::new(TxState {
                cipher: Some(outcome.tx_cipher),
                epoch: 1,
                seq_epoch0: 0,
                seq_epoch1: outcome.tx_seq_epoch1,
            }),
            rx: Mutex::new(RxState {
                cipher: Some(outcome.rx_cipher),
                rx_epoch1: true,
                early_app_data: outcome.early_app_data,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// peer_certificate is the raw DER the peer presented; the owner
    /// byte-compares its digest against the SDP fingerprint.
    pub fn peer_certificate(&self) -> &[u8] {
        &self.peer_certificate
    }

    pub fn selected_srtp_profile(&self) -> u16 {
        SRTP_PROFILE_AES128_CM_SHA1_80
    }

    /// export_keying_material per RFC 5705 over the session secrets.
    pub fn export_keying_material(&self, label: &str, out_len: usize) -> Vec<u8> {
        export_keying_material(
            &self.master_secret,
            label,
            &self.client_random,
            &self.server_random,
            out_len,
        )
    }

    /// export_srtp_keying_material is the RFC 5764 split: the whole
    /// block, caller slices client/server halves by role.
    pub fn export_srtp_keying_material(&self, out_len: usize) -> Vec<u8> {
        self.export_keying_material(EXTRACTOR_LABEL, out_len)
    }

    /// send ships one application-data record.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrConnClosed);
        }

        let raw = {
            let mut tx = self.tx.lock().await;
            let seq = tx.seq_epoch1;
            tx.seq_epoch1 += 1;

            let mut record = Record::new(ContentType::ApplicationData, 1, seq, data.to_vec());
            tx.cipher
                .as_ref()
                .ok_or(Error::ErrConnClosed)?
                .encrypt(&mut record)?;
            record.marshal()
        };

        self.conn.send(&raw).await?;
        Ok(data.len())
    }

    /// recv returns the next application-data payload.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        loop {
            {
                let mut rx = self.rx.lock().await;
                if let Some(data) = rx.early_app_data.pop_front() {
                    return Ok(data);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::ErrConnClosed);
            }

            let mut buf = vec![0u8; 0xffff];
            let n = self.conn.recv(&mut buf).await?;
            self.handle_inbound(&buf[..n]).await?;
        }
    }

    /// handle_inbound processes one datagram that the owner already
    /// classified as DTLS (for the demux-driven receive path).
    pub async fn handle_inbound(&self, datagram: &[u8]) -> Result<()> {
        let records = Record::unmarshal_all(datagram)?;
        let mut rx = self.rx.lock().await;

        for mut record in records {
            match record.content_type {
                ContentType::ApplicationData => {
                    let cipher = rx.cipher.as_ref().ok_or(Error::ErrConnClosed)?;
                    if cipher.decrypt(&mut record).is_err() {
                        log::debug!("dtls: dropping undecryptable record");
                        continue;
                    }
                    rx.early_app_data.push_back(record.payload);
                }
                ContentType::Alert => {
                    // decrypt if the peer already switched epochs
                    if record.epoch > 0 {
                        if let Some(cipher) = rx.cipher.as_ref() {
                            let _ = cipher.decrypt(&mut record);
                        }
                    }
                    if record.payload.len() >= 2 && record.payload[0] == ALERT_LEVEL_FATAL {
                        self.closed.store(true, Ordering::SeqCst);
                        return Err(Error::ErrAlert(record.payload[1]));
                    }
                    if record.payload.len() >= 2 && record.payload[1] == ALERT_CLOSE_NOTIFY {
                        self.closed.store(true, Ordering::SeqCst);
                        return Err(Error::ErrConnClosed);
                    }
                }
                _ => {
                    // late handshake retransmits after establishment
                    log::trace!("dtls: ignoring {:?} after handshake", record.content_type);
                }
            }
        }
        Ok(())
    }

    /// close sends close_notify best-effort.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let raw = {
            let mut tx = self.tx.lock().await;
            let seq = tx.seq_epoch1;
            tx.seq_epoch1 += 1;
            let mut record = Record::new(
                ContentType::Alert,
                1,
                seq,
                vec![1 /* warning */, ALERT_CLOSE_NOTIFY],
            );
            if let Some(cipher) = tx.cipher.as_ref() {
                cipher.encrypt(&mut record)?;
            }
            record.marshal()
        };
        let _ = self.conn.send(&raw).await;
        Ok(())
    }
}

struct HandshakeOutcome {
    master_secret: Vec<u8>,
    client_random: [u8; RANDOM_LENGTH],
    server_random: [u8; RANDOM_LENGTH],
    peer_certificate: Vec<u8>,
    tx_cipher: CipherState,
    rx_cipher: CipherState,
    tx_seq_epoch1: u64,
    early_app_data: VecDeque<Vec<u8>>,
}

/// Handshaker owns the in-flight state: transcript, sequence
/// counters, the last flight for retransmission, and the message
/// queue feeding next_message().
struct Handshaker {
    conn: Arc<dyn Conn + Send + Sync>,
    is_client: bool,
    cert_der: Vec<u8>,
    signing_key: p256::ecdsa::SigningKey,

    transcript: Vec<u8>,
    msg_seq_out: u16,
    seq_epoch0: u64,
    seq_epoch1: u64,

    queue: VecDeque<Message>,
    seen_seqs: HashSet<u16>,
    last_flight: Vec<u8>,

    tx_cipher: Option<CipherState>,
    rx_cipher: Option<CipherState>,
    rx_epoch1: bool,
    early_app_data: VecDeque<Vec<u8>>,
}

impl Handshaker {
    fn new(config: Config, conn: Arc<dyn Conn + Send + Sync>) -> Self {
        Handshaker {
            conn,
            is_client: config.is_client,
            cert_der: config.certificate.der,
            signing_key: config.certificate.signing_key,
            transcript: vec![],
            msg_seq_out: 0,
            seq_epoch0: 0,
            seq_epoch1: 0,
            queue: VecDeque::new(),
            seen_seqs: HashSet::new(),
            last_flight: vec![],
            tx_cipher: None,
            rx_cipher: None,
            rx_epoch1: false,
            early_app_data: VecDeque::new(),
        }
    }

    fn new_random() -> [u8; RANDOM_LENGTH] {
        let mut r = [0u8; RANDOM_LENGTH];
        OsRng.fill_bytes(&mut r);
        r
    }

    fn push_transcript(&mut self, msg: &Message) {
        self.transcript.extend_from_slice(&msg.marshal());
    }

    fn make_message(&mut self, typ: u8, body: Vec<u8>) -> Message {
        let msg = Message {
            typ,
            message_seq: self.msg_seq_out,
            body,
        };
        self.msg_seq_out += 1;
        msg
    }

    /// flush_flight renders queued handshake messages (plus an
    /// optional CCS + encrypted Finished tail) into one datagram,
    /// remembers it for retransmission, and sends it.
    async fn send_flight(
        &mut self,
        plain: &[Message],
        finished: Option<&Message>,
    ) -> Result<()> {
        let mut datagram = vec![];

        for msg in plain {
            let record = Record::new(
                ContentType::Handshake,
                0,
                self.seq_epoch0,
                msg.marshal(),
            );
            self.seq_epoch0 += 1;
            datagram.extend_from_slice(&record.marshal());
        }

        if let Some(finished) = finished {
            let ccs = Record::new(ContentType::ChangeCipherSpec, 0, self.seq_epoch0, vec![1]);
            self.seq_epoch0 += 1;
            datagram.extend_from_slice(&ccs.marshal());

            let mut record = Record::new(
                ContentType::Handshake,
                1,
                self.seq_epoch1,
                finished.marshal(),
            );
            self.seq_epoch1 += 1;
            self.tx_cipher
                .as_ref()
                .ok_or(Error::ErrConnClosed)?
                .encrypt(&mut record)?;
            datagram.extend_from_slice(&record.marshal());
        }

        self.last_flight = datagram.clone();
        self.conn.send(&datagram).await?;
        Ok(())
    }

    async fn resend_last_flight(&self) -> Result<()> {
        if !self.last_flight.is_empty() {
            self.conn.send(&self.last_flight).await?;
        }
        Ok(())
    }

    /// pump reads one datagram and files its contents: handshake
    /// messages into the queue, CCS switches the receive epoch,
    /// alerts abort.
    async fn pump(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 0xffff];
        let n = match timeout(FLIGHT_TIMEOUT, self.conn.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::ErrHandshakeTimeout),
        };

        for mut record in Record::unmarshal_all(&buf[..n])? {
            match record.content_type {
                ContentType::Handshake => {
                    if record.epoch > 0 {
                        if !self.rx_epoch1 {
                            continue;
                        }
                        let cipher = self.rx_cipher.as_ref().ok_or(Error::ErrDecryption)?;
                        cipher.decrypt(&mut record)?;
                    }
                    for msg in Message::unmarshal_all(&record.payload)? {
                        self.queue.push_back(msg);
                    }
                }
                ContentType::ChangeCipherSpec => {
                    self.rx_epoch1 = true;
                }
                ContentType::Alert => {
                    if record.payload.len() >= 2 && record.payload[0] == ALERT_LEVEL_FATAL {
                        return Err(Error::ErrAlert(record.payload[1]));
                    }
                }
                ContentType::ApplicationData => {
                    // the peer finished before us; keep its data
                    if let Some(cipher) = self.rx_cipher.as_ref() {
                        if cipher.decrypt(&mut record).is_ok() {
                            self.early_app_data.push_back(record.payload);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// next_message returns the next fresh handshake message,
    /// answering duplicates with a retransmit of our last flight.
    async fn next_message(&mut self, want: u8) -> Result<Message> {
        let mut budget = RETRANSMIT_BUDGET + 1;

        loop {
            if let Some(msg) = self.queue.pop_front() {
                if self.seen_seqs.contains(&msg.message_seq) {
                    // duplicate: our last flight probably got lost
                    self.resend_last_flight().await?;
                    continue;
                }
                if msg.typ != want {
                    return Err(Error::ErrUnexpectedMessage {
                        got: msg.typ,
                        want,
                    });
                }
                self.seen_seqs.insert(msg.message_seq);
                return Ok(msg);
            }

            match self.pump().await {
                Ok(()) => {}
                Err(Error::ErrHandshakeTimeout) => {
                    budget -= 1;
                    if budget == 0 {
                        return Err(Error::ErrHandshakeTimeout);
                    }
                    if self.is_client {
                        // only the active side re-initiates
                        self.resend_last_flight().await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn install_ciphers(
        &mut self,
        master: &[u8],
        client_random: &[u8],
        server_random: &[u8],
    ) {
        let kb = key_block(master, client_random, server_random);
        if self.is_client {
            self.tx_cipher = CipherState::new(&kb.client_write_key, &kb.client_write_iv).ok();
            self.rx_cipher = CipherState::new(&kb.server_write_key, &kb.server_write_iv).ok();
        } else {
            self.tx_cipher = CipherState::new(&kb.server_write_key, &kb.server_write_iv).ok();
            self.rx_cipher = CipherState::new(&kb.client_write_key, &kb.client_write_iv).ok();
        }
    }

    async fn run_client(&mut self) -> Result<HandshakeOutcome> {
        let client_random = Self::new_random();
        let ecdh = EphemeralSecret::random(&mut OsRng);
        let ecdh_public = ecdh.public_key();

        // flight 1: bare ClientHello, answered with a cookie; this
        // exchange is excluded from the transcript
        let ch1 = self.make_message(
            TYPE_CLIENT_HELLO,
            ClientHello {
                random: client_random,
                cookie: vec![],
            }
            .marshal(),
        );
        self.send_flight(&[ch1], None).await?;

        let hvr_msg = self.next_message(TYPE_HELLO_VERIFY_REQUEST).await?;
        let hvr = HelloVerifyRequest::unmarshal(&hvr_msg.body)?;

        // flight 3: ClientHello with cookie, transcript starts here
        let ch2 = self.make_message(
            TYPE_CLIENT_HELLO,
            ClientHello {
                random: client_random,
                cookie: hvr.cookie,
            }
            .marshal(),
        );
        self.push_transcript(&ch2);
        self.send_flight(&[ch2], None).await?;

        // server flight 4
        let sh_msg = self.next_message(TYPE_SERVER_HELLO).await?;
        let sh = ServerHello::unmarshal(&sh_msg.body)?;
        self.push_transcript(&sh_msg);

        let cert_msg = self.next_message(TYPE_CERTIFICATE).await?;
        let server_cert = CertificateMsg::unmarshal(&cert_msg.body)?;
        self.push_transcript(&cert_msg);

        let ske_msg = self.next_message(TYPE_SERVER_KEY_EXCHANGE).await?;
        let ske = ServerKeyExchange::unmarshal(&ske_msg.body)?;
        self.push_transcript(&ske_msg);

        let certreq_msg = self.next_message(TYPE_CERTIFICATE_REQUEST).await?;
        CertificateRequest::unmarshal(&certreq_msg.body)?;
        self.push_transcript(&certreq_msg);

        let shd_msg = self.next_message(TYPE_SERVER_HELLO_DONE).await?;
        self.push_transcript(&shd_msg);

        // the key-exchange signature must come from the certificate
        let server_public = certificate_public_key(&server_cert.certificate)?;
        let mut signed = client_random.to_vec();
        signed.extend_from_slice(&sh.random);
        signed.extend_from_slice(&ServerKeyExchange::params_bytes(&ske.public_key));
        verify_ecdsa(&server_public, &signed, &ske.signature)?;

        // shared secret and session keys
        let server_ecdh = PublicKey::from_sec1_bytes(&ske.public_key)
            .map_err(|_| Error::ErrSignatureInvalid)?;
        let pre_master = ecdh.diffie_hellman(&server_ecdh);
        let master = master_secret(
            pre_master.raw_secret_bytes().as_slice(),
            &client_random,
            &sh.random,
        );
        self.install_ciphers(&master, &client_random, &sh.random);

        // flight 5
        let own_cert = self.make_message(
            TYPE_CERTIFICATE,
            CertificateMsg {
                certificate: self.cert_der.clone(),
            }
            .marshal(),
        );
        self.push_transcript(&own_cert);

        let cke = self.make_message(
            TYPE_CLIENT_KEY_EXCHANGE,
            ClientKeyExchange {
                public_key: ecdh_public.to_sec1_bytes().to_vec(),
            }
            .marshal(),
        );
        self.push_transcript(&cke);

        let cv_sig = sign_ecdsa(&self.signing_key, &self.transcript);
        let cv = self.make_message(
            TYPE_CERTIFICATE_VERIFY,
            CertificateVerify { signature: cv_sig }.marshal(),
        );
        self.push_transcript(&cv);

        let finished_data = verify_data(&master, "client finished", &self.transcript);
        let finished = self.make_message(
            TYPE_FINISHED,
            Finished {
                verify_data: finished_data,
            }
            .marshal(),
        );
        self.push_transcript(&finished);

        self.send_flight(&[own_cert, cke, cv], Some(&finished)).await?;

        // server flight 6: CCS + Finished
        let server_finished_msg = self.next_message(TYPE_FINISHED).await?;
        let server_finished = Finished::unmarshal(&server_finished_msg.body)?;
        let expect = verify_data(&master, "server finished", &self.transcript);
        if server_finished.verify_data != expect {
            return Err(Error::ErrVerifyDataMismatch);
        }

        Ok(HandshakeOutcome {
            master_secret: master,
            client_random,
            server_random: sh.random,
            peer_certificate: server_cert.certificate,
            tx_cipher: self.tx_cipher.take().ok_or(Error::ErrConnClosed)?,
            rx_cipher: self.rx_cipher.take().ok_or(Error::ErrConnClosed)?,
            tx_seq_epoch1: self.seq_epoch1,
            early_app_data: std::mem::take(&mut self.early_app_data),
        })
    }

    async fn run_server(&mut self) -> Result<HandshakeOutcome> {
        // flight 0/2: cookie exchange
        let ch1_msg = self.next_message(TYPE_CLIENT_HELLO).await?;
        ClientHello::unmarshal(&ch1_msg.body)?;

        let mut cookie = vec![0u8; 16];
        OsRng.fill_bytes(&mut cookie);

        let hvr = self.make_message(
            TYPE_HELLO_VERIFY_REQUEST,
            HelloVerifyRequest {
                cookie: cookie.clone(),
            }
            .marshal(),
        );
        self.send_flight(&[hvr], None).await?;

        let ch2_msg = self.next_message(TYPE_CLIENT_HELLO).await?;
        let ch2 = ClientHello::unmarshal(&ch2_msg.body)?;
        if ch2.cookie != cookie {
            return Err(Error::ErrCookieMismatch);
        }
        self.push_transcript(&ch2_msg);

        let client_random = ch2.random;
        let server_random = Self::new_random();
        let ecdh = EphemeralSecret::random(&mut OsRng);
        let ecdh_public_bytes = ecdh.public_key().to_sec1_bytes().to_vec();

        // flight 4
        let sh = self.make_message(
            TYPE_SERVER_HELLO,
            ServerHello {
                random: server_random,
            }
            .marshal(),
        );
        self.push_transcript(&sh);

        let cert = self.make_message(
            TYPE_CERTIFICATE,
            CertificateMsg {
                certificate: self.cert_der.clone(),
            }
            .marshal(),
        );
        self.push_transcript(&cert);

        let mut signed = client_random.to_vec();
        signed.extend_from_slice(&server_random);
        signed.extend_from_slice(&ServerKeyExchange::params_bytes(&ecdh_public_bytes));
        let ske_sig = sign_ecdsa(&self.signing_key, &signed);

        let ske = self.make_message(
            TYPE_SERVER_KEY_EXCHANGE,
            ServerKeyExchange {
                public_key: ecdh_public_bytes,
                signature: ske_sig,
            }
            .marshal(),
        );
        self.push_transcript(&ske);

        let certreq = self.make_message(TYPE_CERTIFICATE_REQUEST, CertificateRequest.marshal());
        self.push_transcript(&certreq);

        let shd = self.make_message(TYPE_SERVER_HELLO_DONE, vec![]);
        self.push_transcript(&shd);

        self.send_flight(&[sh, cert, ske, certreq, shd], None).await?;

        // client flight 5
        let client_cert_msg = self.next_message(TYPE_CERTIFICATE).await?;
        let client_cert = CertificateMsg::unmarshal(&client_cert_msg.body)?;
        self.push_transcript(&client_cert_msg);

        let cke_msg = self.next_message(TYPE_CLIENT_KEY_EXCHANGE).await?;
        let cke = ClientKeyExchange::unmarshal(&cke_msg.body)?;
        self.push_transcript(&cke_msg);

        // CertificateVerify covers the transcript up to here
        let cv_msg = self.next_message(TYPE_CERTIFICATE_VERIFY).await?;
        let cv = CertificateVerify::unmarshal(&cv_msg.body)?;
        let client_public = certificate_public_key(&client_cert.certificate)?;
        verify_ecdsa(&client_public, &self.transcript, &cv.signature)?;
        self.push_transcript(&cv_msg);

        // session keys must exist before the encrypted Finished
        let client_ecdh = PublicKey::from_sec1_bytes(&cke.public_key)
            .map_err(|_| Error::ErrSignatureInvalid)?;
        let pre_master = ecdh.diffie_hellman(&client_ecdh);
        let master = master_secret(
            pre_master.raw_secret_bytes().as_slice(),
            &client_random,
            &server_random,
        );
        self.install_ciphers(&master, &client_random, &server_random);

        let client_finished_msg = self.next_message(TYPE_FINISHED).await?;
        let client_finished = Finished::unmarshal(&client_finished_msg.body)?;
        let expect = verify_data(&master, "client finished", &self.transcript);
        if client_finished.verify_data != expect {
            return Err(Error::ErrVerifyDataMismatch);
        }
        self.push_transcript(&client_finished_msg);

        // flight 6
        let finished_data = verify_data(&master, "server finished", &self.transcript);
        let finished = self.make_message(
            TYPE_FINISHED,
            Finished {
                verify_data: finished_data,
            }
            .marshal(),
        );
        self.send_flight(&[], Some(&finished)).await?;

        Ok(HandshakeOutcome {
            master_secret: master,
            client_random,
            server_random,
            peer_certificate: client_cert.certificate,
            tx_cipher: self.tx_cipher.take().ok_or(Error::ErrConnClosed)?,
            rx_cipher: self.rx_cipher.take().ok_or(Error::ErrConnClosed)?,
            tx_seq_epoch1: self.seq_epoch1,
            early_app_data: std::mem::take(&mut self.early_app_data),
        })
    }
}
