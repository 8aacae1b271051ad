// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse_macro_input, AttributeArgs, ItemFn, Lit, Meta, MetaNameValue,
    NestedMeta,
};

/// The macro for labeling cephci test cases.
///
/// Test case functions have the signature `async fn test(ctx:
/// &Framework)`. The macro repacks the function body into a boxed future
/// returning a `cephci_testcase::TestOutcome` and creates an entry in the
/// test case inventory that allows the runner to enumerate the test.
///
/// The attribute takes the per-test annotations the YAML suites carry:
/// `polarion_id = "CEPH-..."` links the test to its test-management
/// entry, and `abort_on_fail` marks a failure of this test as fatal to
/// the rest of the run.
#[proc_macro_attribute]
pub fn cephci_testcase(attrib: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attrib as AttributeArgs);
    let item_fn = parse_macro_input!(input as ItemFn);

    let mut polarion_id = quote! { ::core::option::Option::None };
    let mut abort_on_fail = false;
    for arg in args {
        match arg {
            NestedMeta::Meta(Meta::Path(ref path))
                if path.is_ident("abort_on_fail") =>
            {
                abort_on_fail = true;
            }
            NestedMeta::Meta(Meta::NameValue(MetaNameValue {
                ref path,
                lit: Lit::Str(ref value),
                ..
            })) if path.is_ident("polarion_id") => {
                polarion_id = quote! { ::core::option::Option::Some(#value) };
            }
            other => {
                return syn::Error::new_spanned(
                    other,
                    "expected `polarion_id = \"...\"` or `abort_on_fail`",
                )
                .to_compile_error()
                .into();
            }
        }
    }

    // Build the inventory record for this test. The `module_path!()` in
    // the generated code allows the test case to report the
    // fully-qualified path to itself regardless of where it's located.
    let fn_ident = item_fn.sig.ident.clone();
    let fn_name = fn_ident.to_string();
    let submit: proc_macro2::TokenStream = quote! {
        cephci_testcase::inventory_submit! {
            cephci_testcase::TestCase::new(
                module_path!(),
                #fn_name,
                cephci_testcase::TestMetadata {
                    polarion_id: #polarion_id,
                    abort_on_fail: #abort_on_fail,
                },
                cephci_testcase::TestFunction { f: #fn_ident }
            )
        }
    };

    // Rebuild the async body into a future that maps its result onto a
    // `TestOutcome`. This allows tests to use the `?` operator and to
    // `return Ok(())` to pass early; an error that downcasts to
    // `TestSkippedError` marks the test skipped instead of failed.
    let fn_vis = item_fn.vis.clone();
    let fn_inputs = item_fn.sig.inputs.clone();
    let fn_block = item_fn.block;
    let remade_fn = quote! {
        #fn_vis fn #fn_ident(
            #fn_inputs
        ) -> cephci_testcase::BoxFuture<'_, cephci_testcase::TestOutcome> {
            ::std::boxed::Box::pin(async move {
                let result: cephci_testcase::Result<()> = async move {
                    #fn_block
                    Ok(())
                }
                .await;

                match result {
                    Ok(()) => cephci_testcase::TestOutcome::Passed,
                    Err(e) => {
                        match e.downcast_ref::<cephci_testcase::TestSkippedError>() {
                            Some(skip) => cephci_testcase::TestOutcome::Skipped(
                                skip.reason.clone(),
                            ),
                            None => {
                                let msg = format!(
                                    "{}\n    error backtrace: {}",
                                    e,
                                    e.backtrace()
                                );
                                cephci_testcase::TestOutcome::Failed(Some(msg))
                            }
                        }
                    }
                }
            })
        }

        #submit
    };

    remade_fn.into()
}
