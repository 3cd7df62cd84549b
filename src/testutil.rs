use tokio::net::TcpSocket;

/// A loopback port that is bound but never listens.
///
/// Connects to it are refused, and no other socket can take the port while the returned
/// handle is alive.
pub(crate) fn reserved_closed_port() -> (TcpSocket, u16) {
    let sock = TcpSocket::new_v4().unwrap();
    sock.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = sock.local_addr().unwrap().port();
    (sock, port)
}
