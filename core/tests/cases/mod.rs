mod determinism;
mod emulator_socket;
mod lockstep;
#[cfg(unix)]
mod pipe_protocol;
