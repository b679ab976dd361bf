use darling::FromField;
use proc_macro2::TokenStream;
use quote::quote;
use syn::{ExprPath, Ident, Member, Path};

#[derive(FromField)]
#[darling(attributes(ssz))]
pub struct SszField {
    pub ident: Option<Ident>,

    #[darling(default)]
    pub skip: bool,

    #[darling(default)]
    pub with: Option<ExprPath>,
}

impl SszField {
    pub fn root_expr(&self, ssz: &Path, member: &Member) -> TokenStream {
        match &self.with {
            Some(function) => quote! { #function(&self.#member) },
            None => quote! { #ssz::SszHash::hash_tree_root(&self.#member) },
        }
    }
}
