use std::{io, time::Duration};

use tokio::{
    io::{split, ReadHalf, WriteHalf},
    time::sleep,
};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};

/// Open the firmware's USB serial port and pulse DTR so boards that
/// wire DTR to reset come up in a known state before the handshake.
pub async fn open_and_reset_serial(
    path: &str,
    baud: u32,
) -> io::Result<(ReadHalf<SerialStream>, WriteHalf<SerialStream>)> {
    let mut port = tokio_serial::new(path, baud)
        .data_bits(DataBits::Eight)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(30))
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    port.write_data_terminal_ready(false)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    sleep(Duration::from_millis(2)).await;
    port.write_data_terminal_ready(true)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(split(port))
}
