use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use crate::sop::STORAGE_SOP_CLASSES;
use crate::types::AE;
use dicom::dictionary_std::uids;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextNegotiated;
use std::io::ErrorKind;
use std::{convert::identity, net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Inbound (acceptor) association, used by the Storage-SCP.
///
/// Advertises every storage SOP class plus Verification across the
/// supported transfer syntaxes. Like [`super::client::ClientAssociation`],
/// the blocking socket I/O runs on a dedicated OS thread behind an
/// ask-pattern channel.
#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	calling_aet: AE,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	pub aet: String,
	pub tcp_stream: TcpStream,
	/// Restrict negotiation to codec-free transfer syntaxes.
	pub uncompressed: bool,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.accept_any()
			.ae_title(options.aet.clone())
			.promiscuous(true);

		for abstract_syntax in STORAGE_SOP_CLASSES {
			server_options = server_options.with_abstract_syntax(*abstract_syntax);
		}
		server_options = server_options.with_abstract_syntax(uids::VERIFICATION);

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let _handle = thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span =
					tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						info!(
							calling_aet = association.client_ae_title(),
							called_aet = options.aet,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();
						let calling_aet = AE::from(association.client_ae_title());

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream::clone");

						connect_tx
							.send(Ok((stream, pcs, calling_aet)))
							.map_err(|_value| ())?;
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							let send_result = association
								.send(&pdu)
								.map_err(AssociationError::Association);
							response
								.send(send_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let receive_result =
								association.receive().map_err(AssociationError::Association);
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(e) = association.abort() {
					match e {
						dicom::ul::association::Error::WireSend { source, .. }
							if source.kind() == ErrorKind::BrokenPipe =>
						{
							// no-op, happens on MacOS if the TCP stream is already closed
						}
						_ => {
							warn!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_aet) =
			connect_result.await.expect("connect_result.await")?;

		Ok(Self {
			channel: tx,
			presentation_contexts,
			calling_aet,
			tcp_stream,
		})
	}

	/// AE title of the peer that initiated this association.
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	/// Aborts the association by shutting down the transport.
	/// Also reachable through a cloned handle, see [`Self::abort_handle`].
	pub fn abort(&self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			warn!("TcpStream::shutdown failed: {err}");
		}
	}

	/// A transport handle that can abort this association after the
	/// owning task has moved on, e.g. for cancelling inbound C-MOVE
	/// sub-operations by calling AE title.
	pub fn abort_handle(&self) -> Option<AbortHandle> {
		self.tcp_stream
			.try_clone()
			.map(|stream| AbortHandle {
				calling_aet: self.calling_aet.clone(),
				stream,
			})
			.ok()
	}
}

/// Cloneable transport shutdown handle for a server association.
#[derive(Debug)]
pub struct AbortHandle {
	calling_aet: AE,
	stream: TcpStream,
}

impl AbortHandle {
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	pub fn abort(&self) {
		if let Err(err) = self.stream.shutdown(std::net::Shutdown::Both) {
			debug!("AbortHandle shutdown failed: {err}");
		}
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		self.abort();
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.abort();
	}
}
