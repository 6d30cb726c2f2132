mod cli;
mod core;

fn main() {
  cli::main();
}
