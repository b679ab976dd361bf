use darling::{FromDeriveInput, ast::Data};
use itertools::Itertools as _;
use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{
    Error, Generics, Ident, ImplItemFn, Member, Path, WhereClause, WherePredicate, parse_quote,
    punctuated::Punctuated,
    token::{Comma, Where},
};

use crate::{crate_path, ssz_field::SszField};

#[derive(FromDeriveInput)]
// Darling has the `#[darling(supports(…))]` attribute for restricting the shape of types that the
// derive macro can be applied to. We don't use it because the error messages it produces are too
// generic. We accept types of all shapes and validate them ourselves in `SszType::all_fields`.
#[darling(attributes(ssz))]
pub struct SszType {
    ident: Ident,
    generics: Generics,
    data: Data<(), SszField>,

    // This is named `bound` to mimic other derive macros.
    bound: Option<Punctuated<WherePredicate, Comma>>,
    // This is needed to make deriving work inside the `ssz` crate itself.
    #[darling(default)]
    internal: bool,
    #[darling(default)]
    transparent: bool,
}

impl SszType {
    pub fn impls(&self) -> Result<TokenStream, Error> {
        let (impl_generics, ty_generics, where_clause) = self.generics.split_for_impl();

        let where_clause = self
            .bound
            .clone()
            .map(|predicates| WhereClause {
                where_token: Where::default(),
                predicates,
            })
            .or_else(|| where_clause.cloned());

        let ssz = self.ssz_path()?;
        let ident = &self.ident;
        let hash_tree_root_fn_impl = self.hash_tree_root_fn_impl(&ssz)?;

        Ok(quote! {
            impl #impl_generics #ssz::SszHash for #ident #ty_generics #where_clause {
                #hash_tree_root_fn_impl
            }
        })
    }

    fn ssz_path(&self) -> Result<Path, Error> {
        if self.internal {
            Ok(parse_quote! { crate })
        } else {
            crate_path::crate_path("ssz")
        }
    }

    fn hash_tree_root_fn_impl(&self, ssz: &Path) -> Result<ImplItemFn, Error> {
        if self.transparent {
            let (member, ssz_field) = self.single_unskipped_field()?;
            let root = ssz_field.root_expr(ssz, &member);

            return Ok(parse_quote! {
                #[inline]
                fn hash_tree_root(&self) -> #ssz::H256 {
                    #root
                }
            });
        }

        let mut nodes = self
            .unskipped_fields()?
            .map(|(member, ssz_field)| ssz_field.root_expr(ssz, &member))
            .collect_vec();

        let mut height = 0_usize;

        let root = loop {
            match nodes.len() {
                0 => {
                    return Err(Error::new(
                        Span::call_site(),
                        "struct has no unskipped fields",
                    ));
                }
                1 => {
                    break nodes
                        .into_iter()
                        .exactly_one()
                        .expect("this branch is executed when nodes contains exactly 1 element");
                }
                _ => {
                    let zero_hash_expr = quote! { #ssz::hashing::ZERO_HASHES[#height] };

                    nodes = nodes
                        .into_iter()
                        .chain(core::iter::once(zero_hash_expr))
                        .tuples()
                        .map(|(left, right)| quote! { #ssz::hashing::hash_256_256(#left, #right) })
                        .collect();

                    height += 1;
                }
            }
        };

        Ok(parse_quote! {
            fn hash_tree_root(&self) -> #ssz::H256 {
                #root
            }
        })
    }

    fn single_unskipped_field(&self) -> Result<(Member, &SszField), Error> {
        self.unskipped_fields()?.exactly_one().map_err(|_| {
            Error::new(
                Span::call_site(),
                "struct with transparent attribute must have exactly one unskipped field",
            )
        })
    }

    fn unskipped_fields(&self) -> Result<impl Iterator<Item = (Member, &SszField)>, Error> {
        let fields = self.all_fields()?;
        Ok(fields.filter(|(_, ssz_field)| !ssz_field.skip))
    }

    fn all_fields(&self) -> Result<impl Iterator<Item = (Member, &SszField)>, Error> {
        match &self.data {
            Data::Enum(_) => Err(Error::new(
                Span::call_site(),
                "SSZ unions are not implemented",
            )),
            Data::Struct(fields) if fields.is_empty() => Err(Error::new(
                Span::call_site(),
                "SSZ containers with no fields are illegal",
            )),
            Data::Struct(fields) => Ok(fields.iter().enumerate().map(|(position, ssz_field)| {
                let member = ssz_field
                    .ident
                    .clone()
                    .map(Member::Named)
                    .unwrap_or_else(|| Member::Unnamed(position.into()));
                (member, ssz_field)
            })),
        }
    }
}
