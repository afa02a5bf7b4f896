//! Binary entry point. All of the actual boot sequence — Limine requests,
//! subsystem init order, `_start` itself — lives in `aurelia_kernel::boot`;
//! this crate only needs to exist so Cargo has something to link into the
//! `aurelia-kernel` ELF that `limine.conf` points at.

#![no_std]
#![no_main]

extern crate aurelia_kernel;
