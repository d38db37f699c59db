//! Test attributes that run a test body on a watchdog thread so a hung
//! session never wedges the whole test binary.
//!
//! - `#[tokio_timeout_test(secs)]`: async body on a current-thread runtime,
//!   bounded by both a Tokio timeout and the wall-clock watchdog.
//! - `#[paused_tokio_test(secs)]`: async body on a current-thread runtime
//!   with a paused clock, so session timeouts of a minute or two elapse
//!   instantly. Only the wall-clock watchdog applies; a virtual-time timeout
//!   would fire ahead of the timers under test.
//! - `#[timeout(secs)]`: synchronous body with the wall-clock watchdog.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Body {
    Sync,
    Async,
    AsyncPaused,
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Body::Async)
}

#[proc_macro_attribute]
pub fn paused_tokio_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Body::AsyncPaused)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Body::Sync)
}

fn expand(attr: TokenStream, item: TokenStream, body: Body) -> TokenStream {
    let timeout_secs = if attr.is_empty() {
        DEFAULT_TIMEOUT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into();
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let is_async = sig.asyncness.is_some();
    match (body, is_async) {
        (Body::Sync, true) => {
            return syn::Error::new_spanned(
                &sig.ident,
                "timeout attribute expects a synchronous test function",
            )
            .to_compile_error()
            .into();
        }
        (Body::Async | Body::AsyncPaused, false) => {
            return syn::Error::new_spanned(
                &sig.ident,
                "this attribute can only be applied to async functions",
            )
            .to_compile_error()
            .into();
        }
        _ => {}
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let run: TokenStream2 = match body {
        Body::Sync => quote! { #block },
        Body::Async => quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        },
        Body::AsyncPaused => quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build paused Tokio runtime");
            runtime.block_on(async move #block);
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #run
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// Drops `#[test]` and `#[tokio::test]` so the generated harness is the only one.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
