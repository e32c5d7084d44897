//! in-process ssh server for driving [super::run_remote] end to end
//!
//! Commands are not executed, each one is a small script:
//! - `true` exits 0
//! - `echo <text>` prints text and exits 0
//! - `exit <status>` prints `exit <status>` to stderr and exits with status
//! - `kill` is terminated by SIGTERM
//! - `noisy <len>` writes len bytes to stderr before a line to stdout
//! - `sleep` never completes

use std::{
	net::SocketAddr,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use russh::{
	keys::{self, Certificate, PublicKey},
	server::{self, Auth, Handle, Msg, Server as _, Session},
	Channel, ChannelId, CryptoVec, Sig,
};
use tokio::{net::TcpListener, task::JoinHandle};

pub const USER: &str = "test";
pub const PASSWORD: &str = "test";

pub fn fixture(name: &str) -> PathBuf {
	Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

pub struct TestServer {
	pub addr: SocketAddr,
	open: Arc<AtomicUsize>,
	task: JoinHandle<()>,
}

impl TestServer {
	/// listen on a random local port until dropped
	pub async fn start() -> Self {
		let config = Arc::new(server::Config {
			keys: vec![keys::load_secret_key(fixture("server_ed25519"), None).unwrap()],
			auth_rejection_time: Duration::from_millis(10),
			auth_rejection_time_initial: Some(Duration::ZERO),
			inactivity_timeout: Some(Duration::from_secs(30)),
			..Default::default()
		});

		let open = Arc::new(AtomicUsize::new(0));
		let mut sshd = Sshd {
			client_key: keys::load_secret_key(fixture("id_ed25519_test"), None)
				.unwrap()
				.public_key()
				.clone(),
			certificate_authority: keys::load_public_key(fixture("ca_ed25519.pub")).unwrap(),
			open: Arc::clone(&open),
		};

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let task = tokio::spawn(async move {
			let _ = sshd.run_on_socket(config, &listener).await;
		});

		Self { addr, open, task }
	}

	/// `host:port` to put into a plan
	pub fn host(&self) -> String {
		self.addr.to_string()
	}

	/// write a known hosts file trusting `key_line` for this server
	pub fn known_hosts(&self, dir: &Path, key_line: &str) -> PathBuf {
		let path = dir.join("known_hosts");
		let entry = format!("[{}]:{} {}\n", self.addr.ip(), self.addr.port(), key_line.trim());
		std::fs::write(&path, entry).unwrap();
		path
	}

	pub fn open_connections(&self) -> usize {
		self.open.load(Ordering::SeqCst)
	}

	/// wait until every client connection is gone
	pub async fn all_closed(&self, within: Duration) -> bool {
		let deadline = Instant::now() + within;
		while self.open_connections() > 0 {
			if Instant::now() > deadline {
				return false;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		true
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.task.abort();
	}
}

#[derive(Clone)]
struct Sshd {
	client_key: PublicKey,
	certificate_authority: PublicKey,
	open: Arc<AtomicUsize>,
}

impl server::Server for Sshd {
	type Handler = Client;

	fn new_client(&mut self, _: Option<SocketAddr>) -> Client {
		self.open.fetch_add(1, Ordering::SeqCst);
		Client { sshd: self.clone() }
	}
}

/// one connected client, dropped when its connection ends
struct Client {
	sshd: Sshd,
}

impl Drop for Client {
	fn drop(&mut self) {
		self.sshd.open.fetch_sub(1, Ordering::SeqCst);
	}
}

fn accept_if(accepted: bool) -> Auth {
	if accepted {
		Auth::Accept
	} else {
		Auth::reject()
	}
}

impl server::Handler for Client {
	type Error = russh::Error;

	async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
		Ok(accept_if(user == USER && password == PASSWORD))
	}

	async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
		Ok(accept_if(user == USER && key.key_data() == self.sshd.client_key.key_data()))
	}

	// validity and signature are checked before this is called
	async fn auth_openssh_certificate(
		&mut self,
		user: &str,
		certificate: &Certificate,
	) -> Result<Auth, Self::Error> {
		Ok(accept_if(
			user == USER
				&& certificate.signature_key() == self.sshd.certificate_authority.key_data()
				&& certificate.valid_principals().iter().any(|principal| principal == user),
		))
	}

	async fn channel_open_session(
		&mut self,
		_channel: Channel<Msg>,
		_session: &mut Session,
	) -> Result<bool, Self::Error> {
		Ok(true)
	}

	async fn exec_request(
		&mut self,
		channel: ChannelId,
		data: &[u8],
		session: &mut Session,
	) -> Result<(), Self::Error> {
		session.channel_success(channel)?;

		// the session loop has to keep running to honour window adjustments
		let command = String::from_utf8_lossy(data).into_owned();
		let handle = session.handle();
		tokio::spawn(async move {
			let _ = script(&handle, channel, &command).await;
		});

		Ok(())
	}
}

async fn script(handle: &Handle, channel: ChannelId, command: &str) -> Result<(), ()> {
	let (program, args) = command.split_once(' ').unwrap_or((command, ""));

	match program {
		"true" => exit(handle, channel, 0).await,
		"echo" => {
			stdout(handle, channel, format!("{}\n", args).as_bytes()).await?;
			exit(handle, channel, 0).await
		}
		"exit" => {
			let status = args.trim().parse().unwrap_or(1);
			stderr(handle, channel, format!("exit {}\n", status).as_bytes()).await?;
			exit(handle, channel, status).await
		}
		"kill" => {
			stderr(handle, channel, b"terminated\n").await?;
			handle
				.exit_signal_request(channel, Sig::TERM, false, String::new(), String::new())
				.await?;
			handle.eof(channel).await?;
			handle.close(channel).await
		}
		"noisy" => {
			let len = args.trim().parse().unwrap_or(0);
			stderr(handle, channel, &vec![b'x'; len]).await?;
			stdout(handle, channel, b"done\n").await?;
			exit(handle, channel, 0).await
		}
		"sleep" => Ok(()),
		_ => {
			stderr(handle, channel, b"command not found\n").await?;
			exit(handle, channel, 127).await
		}
	}
}

async fn stdout(handle: &Handle, channel: ChannelId, data: &[u8]) -> Result<(), ()> {
	handle.data(channel, CryptoVec::from_slice(data)).await.map_err(drop)
}

async fn stderr(handle: &Handle, channel: ChannelId, data: &[u8]) -> Result<(), ()> {
	handle.extended_data(channel, 1, CryptoVec::from_slice(data)).await.map_err(drop)
}

async fn exit(handle: &Handle, channel: ChannelId, status: u32) -> Result<(), ()> {
	handle.exit_status_request(channel, status).await?;
	handle.eof(channel).await?;
	handle.close(channel).await
}
