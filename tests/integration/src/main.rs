mod helpers;

mod admin;
mod cli;
mod gossip;
mod persistence;
