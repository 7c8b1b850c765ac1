//! # DeepONet 作用素学習ライブラリ
//!
//! `burn` フレームワークを使用して、事象の位置 (x, y, z) と総光電子数から
//! 可視エネルギーを予測する DeepONet を構築・学習するための主要なコンポーネントを提供します。
//!
//! ブランチネットが条件入力を、トランクネットが問い合わせ座標を同じ幅の潜在ベクトルに埋め込み、
//! その内積にバイアスを加えたものが出力になります。

pub mod branch;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod loss;
pub mod mlp;
pub mod model;
pub mod normalizer;
pub mod operator;
pub mod output;
pub mod training;

pub use error::{DeepOnetError, Result};
